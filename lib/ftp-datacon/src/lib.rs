/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ftp-datacon authors
 */

mod base;
mod config;
mod disk;
mod download;
mod event;
mod inflate;
mod proxy;
mod sniff;
mod speed;
mod stream;
mod upload;

pub use config::{AsciiProblemResolution, DataConnectionConfig, TransferMode};
pub use disk::{DiskWriteChannel, WriteFinished, WriteRequest};
pub use download::{
    DataConnection, DataConnectionOptions, FlushData, TransferErrors, TransferProgress,
};
pub use event::{DataConnEvent, TransferStatus};
pub use inflate::{InflateError, InflateStep, StreamInflater};
pub use proxy::{DataProxyConfig, DataProxyProtocol, ProxyError};
pub use sniff::looks_like_text;
pub use speed::{SharedTick, TransferSpeedMeter, tick_ms};
pub use stream::{DataStream, TlsConnectContext};
pub use upload::{UploadConnectionOptions, UploadDataConnection, UploadErrors};
