/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ftp-datacon authors
 */

use std::time::Duration;

/// How many bytes to read from the socket per step when collecting a
/// transfer in memory, and how much to preallocate beyond that so the next
/// read does not allocate again.
const MEMORY_READ_CHUNK: usize = 8192;
/// Size of the buffers used to hand received data over for verification or
/// disk write-back.
const FLUSH_BUFFER_SIZE: usize = 65536;
/// How long a partially filled receive buffer may sit before it is flushed
/// anyway.
const FLUSH_TIMEOUT: Duration = Duration::from_millis(1000);
/// Cadence of the no-data-transfer liveness check.
const NO_DATA_CHECK_INTERVAL: Duration = Duration::from_millis(10000);

/// Tunables of a data connection. The defaults mirror long-standing FTP
/// client practice; only the idle threshold is commonly adjusted.
#[derive(Debug, Clone)]
pub struct DataConnectionConfig {
    /// per-read growth step of the in-memory accumulator
    pub memory_read_chunk: usize,
    /// size of the receive/flush buffer pair in flush mode
    pub flush_buffer_size: usize,
    /// deadline for flushing a partially filled receive buffer
    pub flush_timeout: Duration,
    /// how often the no-data-transfer condition is evaluated
    pub no_data_check_interval: Duration,
    /// idle threshold after which a stalled connection is torn down as if
    /// the peer had reset it
    pub no_data_timeout: Duration,
    /// limit for the passive mode TCP connect (including proxy traversal)
    pub connect_timeout: Duration,
}

impl Default for DataConnectionConfig {
    fn default() -> Self {
        DataConnectionConfig {
            memory_read_chunk: MEMORY_READ_CHUNK,
            flush_buffer_size: FLUSH_BUFFER_SIZE,
            flush_timeout: FLUSH_TIMEOUT,
            no_data_check_interval: NO_DATA_CHECK_INTERVAL,
            no_data_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl DataConnectionConfig {
    pub fn set_no_data_timeout(&mut self, timeout: Duration) {
        self.no_data_timeout = timeout;
    }
}

/// Transfer mode negotiated on the control connection, used here only to
/// drive the ASCII-looking-data advisory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransferMode {
    #[default]
    Unknown,
    Ascii,
    Binary,
}

/// How to resolve an "ASCII transfer mode for a binary file" advisory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AsciiProblemResolution {
    /// surface the advisory and let the user decide
    #[default]
    Ask,
    /// restart the download in binary mode
    RedownloadAsBinary,
    /// abort the download
    CancelDownload,
    /// finish the download in ASCII mode anyway
    Ignore,
}
