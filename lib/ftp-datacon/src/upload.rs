/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ftp-datacon authors
 */

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use flate2::{Compress, Compression, FlushCompress, Status};
use log::{error, warn};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::base::{AttemptReset, ConnCore, SocketSlot, State};
use crate::config::DataConnectionConfig;
use crate::download::TransferProgress;
use crate::event::{DataConnEvent, OwnerNotifier};
use crate::proxy::{self, DataProxyConfig};
use crate::speed::{SharedTick, TransferSpeedMeter, tick_ms};
use crate::stream::{DataStream, TlsConnectContext};

/// Startup throughput of a fresh connection mostly measures how fast the
/// local socket buffer fills; bytes sent within this window after the first
/// write are kept out of the speed meter.
const LOCAL_BUFFER_FILL_MS: u64 = 100;

/// Construction-time options of an upload data connection.
#[derive(Default)]
pub struct UploadConnectionOptions {
    /// MODE Z: deflate the prepared data before it goes out on the wire
    pub compress: bool,
    pub tls: Option<TlsConnectContext>,
    pub proxy: Option<DataProxyConfig>,
}

/// Sticky error snapshot of an upload connection.
#[derive(Debug, Clone, Default)]
pub struct UploadErrors {
    pub net_error: Option<Arc<io::Error>>,
    pub tls_error: Option<Arc<io::Error>>,
    pub no_data_timeout: bool,
}

pub(crate) struct UploadState {
    /// bytes queued for the socket; `None` while the writer holds it
    write_buf: Option<Vec<u8>>,
    write_off: usize,
    write_discard: bool,
    /// logical (uncompressed) bytes represented by the unsent tail of
    /// `write_buf`
    plain_in_write: usize,
    /// prepared data waiting to be swapped in; `None` while handed to the
    /// owner for refilling (plain mode)
    flush_buf: Option<Vec<u8>>,
    /// the flush buffer holds a complete batch, ready for the swap
    flush_ready: bool,
    /// logical bytes represented by the flush buffer content
    plain_in_flush: usize,
    /// plaintext slot the owner fills under MODE Z; `None` while handed out
    compr_buf: Option<Vec<u8>>,
    compr_handed_out: bool,
    /// plaintext range whose compression was postponed because the flush
    /// buffer filled up
    compr_delayed_off: usize,
    compr_delayed_len: usize,
    deflater: Option<Compress>,
    total_sent: u64,
    data_total_size: Option<u64>,
    eof_reached: bool,
    closed_on_eof: bool,
    prepare_sent: bool,
    /// no data goes out before the owner activates the transfer
    activated: bool,
    first_write_time: u64,
    skipped_after_connect: u64,
    close_requested: bool,
}

impl UploadState {
    fn new(buffer_size: usize, compress: bool) -> Self {
        UploadState {
            write_buf: Some(Vec::with_capacity(buffer_size)),
            write_off: 0,
            write_discard: false,
            plain_in_write: 0,
            flush_buf: Some(Vec::with_capacity(buffer_size)),
            flush_ready: false,
            plain_in_flush: 0,
            compr_buf: None,
            compr_handed_out: false,
            compr_delayed_off: 0,
            compr_delayed_len: 0,
            deflater: compress.then(|| Compress::new(Compression::new(6), true)),
            total_sent: 0,
            data_total_size: None,
            eof_reached: false,
            closed_on_eof: false,
            prepare_sent: false,
            activated: false,
            first_write_time: 0,
            skipped_after_connect: 0,
            close_requested: false,
        }
    }

    fn write_remaining(&self) -> usize {
        self.write_buf
            .as_ref()
            .map(|b| b.len() - self.write_off)
            .unwrap_or(0)
    }

    fn all_flushed(&self) -> bool {
        self.write_remaining() == 0
            && !self.flush_ready
            && self.compr_delayed_off >= self.compr_delayed_len
    }
}

impl AttemptReset for UploadState {
    fn clear_before_connect(&mut self) {
        if let Some(b) = &mut self.write_buf {
            b.clear();
        }
        self.write_off = 0;
        self.write_discard = false;
        self.plain_in_write = 0;
        if let Some(b) = &mut self.flush_buf {
            b.clear();
        }
        self.flush_ready = false;
        self.plain_in_flush = 0;
        self.compr_delayed_off = 0;
        self.compr_delayed_len = 0;
        if let Some(deflater) = &mut self.deflater {
            deflater.reset();
        }
        self.total_sent = 0;
        self.data_total_size = None;
        self.eof_reached = false;
        self.closed_on_eof = false;
        self.prepare_sent = false;
        self.first_write_time = 0;
        self.skipped_after_connect = 0;
        self.close_requested = false;
    }
}

/// Sending side of one FTP data transfer (STOR/APPE): the owner prepares
/// file data into a double-buffered pipeline which the transfer task drains
/// to the socket, optionally deflating it for MODE Z. The connection closes
/// itself once everything up to end-of-file has been written.
pub struct UploadDataConnection {
    core: ConnCore<UploadState>,
}

impl UploadDataConnection {
    pub fn new(
        cfg: DataConnectionConfig,
        options: UploadConnectionOptions,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DataConnEvent>) {
        let (notifier, event_rx) = OwnerNotifier::new();
        let ext = UploadState::new(cfg.flush_buffer_size, options.compress);
        let core = ConnCore::new(
            cfg,
            options.compress,
            options.tls,
            options.proxy,
            notifier,
            ext,
        );
        (Arc::new(UploadDataConnection { core }), event_rx)
    }

    pub fn set_passive(&self, server: SocketAddr, log_id: u32) {
        self.core.set_passive(server, log_id);
    }

    pub fn set_active(&self, log_id: u32) {
        self.core.set_active(log_id);
    }

    pub async fn passive_connect(&self) -> io::Result<()> {
        self.core.passive_connect().await
    }

    pub async fn open_for_listening(
        &self,
        local_addr: SocketAddr,
        expected_peer: SocketAddr,
    ) -> io::Result<SocketAddr> {
        self.core.open_for_listening(local_addr, expected_peer).await
    }

    pub fn get_listen_addr(&self) -> Option<SocketAddr> {
        self.core.get_listen_addr()
    }

    /// Passive-retry handling of the base, plus lifting the gate that holds
    /// data back until the transfer command is out.
    pub async fn activate_connection(&self) {
        self.core.activate_connection().await;
        let mut st = self.core.lock();
        st.ext.activated = true;
        self.core.wake.notify_one();
    }

    pub fn is_transferring(&self) -> (bool, bool) {
        self.core.is_transferring()
    }

    pub fn get_last_activity_time(&self) -> u64 {
        self.core.get_last_activity_time()
    }

    pub fn get_socket_close_time(&self) -> u64 {
        self.core.get_socket_close_time()
    }

    pub fn set_owner_notifications(&self, enabled: bool) {
        self.core.notifier.set_enabled(enabled);
    }

    pub fn set_global_transfer_speed_meter(&self, meter: Option<Arc<TransferSpeedMeter>>) {
        self.core.set_global_transfer_speed_meter(meter);
    }

    pub fn set_global_last_activity_time(&self, shared: Option<Arc<SharedTick>>) {
        self.core.set_global_last_activity_time(shared);
    }

    pub fn set_data_total_size(&self, size: Option<u64>) {
        self.core.lock().ext.data_total_size = size;
    }

    pub fn get_error(&self) -> UploadErrors {
        let st = self.core.lock();
        UploadErrors {
            net_error: st.base.net_error.clone(),
            tls_error: st.base.tls_error.clone(),
            no_data_timeout: st.base.no_data_timeout_hit,
        }
    }

    pub fn get_total_sent(&self) -> u64 {
        self.core.lock().ext.total_sent
    }

    /// All data up to end-of-file was written and the connection was closed
    /// cleanly on our side.
    pub fn all_data_transferred(&self) -> bool {
        self.core.lock().ext.closed_on_eof
    }

    pub fn get_status(&self) -> TransferProgress {
        let st = self.core.lock();
        let uploaded = st.ext.total_sent;
        let total = st.ext.data_total_size.map(|t| t.max(uploaded));
        let idle_ms = tick_ms().saturating_sub(st.base.last_activity);
        TransferProgress {
            downloaded: uploaded,
            total,
            idle_time: Duration::from_millis(idle_ms),
            speed: self.core.speed.speed(),
        }
    }

    /// The server confirmed the upload. Bytes that went into local socket
    /// buffers right after connect are folded into the speed meter now, so
    /// small uploads do not report a nonsensically low rate.
    pub fn upload_finished(&self) {
        let mut st = self.core.lock();
        if st.ext.closed_on_eof && st.ext.skipped_after_connect > 0 {
            let now = tick_ms();
            self.core.speed.add_bytes(st.ext.skipped_after_connect, now);
            if let Some(global) = &st.base.global_speed {
                global.add_bytes(st.ext.skipped_after_connect, now);
            }
            st.ext.skipped_after_connect = 0;
        }
    }

    pub fn update_pause_status(&self, pause: bool) {
        let mut st = self.core.lock();
        if st.base.paused != pause {
            st.base.paused = pause;
            if !pause {
                st.base.touch_activity();
                self.core.speed.clear();
                self.core.speed.just_connected();
                if self.core.compress {
                    self.core.compr_speed.clear();
                    self.core.compr_speed.just_connected();
                }
            }
            self.core.wake.notify_one();
        }
    }

    /// Tear the connection down early and abandon buffered data.
    pub fn cancel_connection(&self) {
        let mut st = self.core.lock();
        st.base.cancelled = true;
        st.base.sock = SocketSlot::Empty;
        self.free_buffered_data_locked(&mut st);
        self.core.wake.notify_one();
    }

    /// Drop all prepared-but-unsent data.
    pub fn free_buffered_data(&self) {
        let mut st = self.core.lock();
        self.free_buffered_data_locked(&mut st);
    }

    fn free_buffered_data_locked(&self, st: &mut State<UploadState>) {
        match st.ext.write_buf.as_mut() {
            Some(b) => {
                b.clear();
                st.ext.write_off = 0;
            }
            None => st.ext.write_discard = true,
        }
        st.ext.plain_in_write = 0;
        if let Some(b) = st.ext.flush_buf.as_mut() {
            b.clear();
        }
        st.ext.flush_ready = false;
        st.ext.plain_in_flush = 0;
        st.ext.compr_delayed_off = 0;
        st.ext.compr_delayed_len = 0;
        // whatever end-of-file was reached no longer holds once its tail
        // was thrown away
        st.ext.eof_reached = false;
    }

    /// Hand the owner an empty buffer to fill with the next batch of file
    /// data. `None` while both buffers are busy (or while a postponed
    /// compression round keeps the pipeline occupied).
    pub fn give_buffer_for_data(&self) -> Option<Vec<u8>> {
        let mut st = self.core.lock();
        if st.ext.flush_ready {
            return None;
        }
        if self.core.compress {
            if st.ext.compr_delayed_off < st.ext.compr_delayed_len {
                // finish compressing the postponed range first
                self.data_buffer_prepared_locked(&mut st, None);
                return None;
            }
            let mut buf = match st.ext.compr_buf.take() {
                Some(b) => b,
                None => {
                    if st.ext.compr_handed_out {
                        warn!("plaintext buffer has already been given out");
                        return None;
                    }
                    Vec::with_capacity(self.core.cfg.flush_buffer_size)
                }
            };
            buf.clear();
            st.ext.compr_handed_out = true;
            st.ext.compr_delayed_off = 0;
            st.ext.compr_delayed_len = 0;
            Some(buf)
        } else {
            match st.ext.flush_buf.take() {
                Some(mut b) => {
                    b.clear();
                    Some(b)
                }
                None => {
                    warn!("flush buffer has already been given out");
                    None
                }
            }
        }
    }

    /// The owner filled the buffer from `give_buffer_for_data`; an empty
    /// buffer signals end-of-file. Under MODE Z the data is deflated into
    /// the wire buffer here, possibly across several refill rounds.
    pub fn data_buffer_prepared(&self, buffer: Vec<u8>) {
        let mut st = self.core.lock();
        self.data_buffer_prepared_locked(&mut st, Some(buffer));
    }

    fn data_buffer_prepared_locked(&self, st: &mut State<UploadState>, buffer: Option<Vec<u8>>) {
        st.ext.prepare_sent = false;
        if self.core.compress {
            if let Some(buffer) = buffer {
                if st.ext.compr_buf.is_some() {
                    warn!("plaintext buffer returned while the slot is occupied");
                }
                st.ext.compr_handed_out = false;
                st.ext.compr_delayed_off = 0;
                st.ext.compr_delayed_len = buffer.len();
                st.ext.compr_buf = Some(buffer);
            }
            self.compress_round(st);
        } else if let Some(buffer) = buffer {
            if st.ext.flush_buf.is_some() {
                warn!("flush buffer returned while the slot is occupied");
            }
            if buffer.is_empty() {
                st.ext.eof_reached = true;
            }
            st.ext.plain_in_flush = buffer.len();
            st.ext.flush_ready = !buffer.is_empty();
            st.ext.flush_buf = Some(buffer);
        } else {
            warn!("data_buffer_prepared() without a buffer");
        }

        if (st.ext.flush_ready || st.ext.eof_reached) && st.ext.write_remaining() == 0 {
            self.move_flush_to_write(st);
            if !st.ext.eof_reached && !st.ext.prepare_sent {
                st.ext.prepare_sent = true;
                self.core.notifier.post(DataConnEvent::PrepareData);
            }
        }
        self.core.wake.notify_one();
    }

    /// One deflate round: compress the pending plaintext range into the
    /// wire buffer. Fills the buffer across refill rounds and only marks it
    /// ready when it is full or the stream is finished.
    fn compress_round(&self, st: &mut State<UploadState>) {
        let ext = &mut st.ext;
        let Some(out) = ext.flush_buf.as_mut() else {
            return;
        };
        let Some(deflater) = ext.deflater.as_mut() else {
            return;
        };
        let input_all = ext.compr_buf.as_deref().unwrap_or_default();
        let input = &input_all[ext.compr_delayed_off..ext.compr_delayed_len];
        let finish = input_all.is_empty();
        let flush = if finish {
            FlushCompress::Finish
        } else {
            FlushCompress::None
        };

        let in_before = deflater.total_in();
        let status = match deflater.compress_vec(input, out, flush) {
            Ok(status) => status,
            Err(e) => {
                warn!("deflate failed unexpectedly: {e}");
                return;
            }
        };
        let consumed = (deflater.total_in() - in_before) as usize;
        ext.compr_delayed_off += consumed;
        ext.plain_in_flush += consumed;

        if status == Status::StreamEnd {
            // every byte up to end-of-file is compressed and terminated
            ext.eof_reached = true;
            ext.flush_ready = !out.is_empty() || ext.plain_in_flush > 0;
            ext.compr_delayed_off = 0;
            ext.compr_delayed_len = 0;
            return;
        }
        if ext.compr_delayed_off < ext.compr_delayed_len || finish {
            // output filled up before the input (or the stream trailer) was
            // through; the rest is postponed to the next round
            ext.flush_ready = true;
        } else {
            ext.compr_delayed_off = 0;
            ext.compr_delayed_len = 0;
            if out.len() < out.capacity() {
                if !ext.prepare_sent {
                    ext.prepare_sent = true;
                    self.core.notifier.post(DataConnEvent::PrepareData);
                }
            } else {
                ext.flush_ready = true;
            }
        }
    }

    /// Swap the prepared buffer into the write position.
    fn move_flush_to_write(&self, st: &mut State<UploadState>) {
        if !st.ext.flush_ready {
            return;
        }
        let Some(mut spare) = st.ext.write_buf.take() else {
            // the writer holds the buffer; it swaps after the write returns
            return;
        };
        spare.clear();
        let data = st.ext.flush_buf.take().unwrap_or_default();
        st.ext.write_buf = Some(data);
        st.ext.write_off = 0;
        st.ext.plain_in_write = st.ext.plain_in_flush;
        st.ext.plain_in_flush = 0;
        st.ext.flush_buf = Some(spare);
        st.ext.flush_ready = false;
    }

    fn mark_socket_closed(&self, st: &mut State<UploadState>) {
        st.base.socket_close_time = tick_ms();
        st.base.connected_now = false;
    }

    fn socket_was_closed(&self, st: &mut State<UploadState>, error: Option<io::Error>) {
        if let Some(e) = error {
            st.base.net_error = Some(Arc::new(e));
        }
        self.mark_socket_closed(st);
        self.core.notifier.post(DataConnEvent::ConnectionClosed);
    }

    /// Drive the transfer: finish establishment, then pump prepared data to
    /// the socket until end-of-file or failure.
    pub async fn run(&self) {
        let Some(stream) = self.establish().await else {
            return;
        };
        self.transfer_loop(stream).await;
    }

    async fn establish(&self) -> Option<DataStream> {
        let slot = {
            let mut st = self.core.lock();
            std::mem::replace(&mut st.base.sock, SocketSlot::Empty)
        };
        match slot {
            SocketSlot::Stream(tcp) => {
                {
                    let mut st = self.core.lock();
                    self.core.just_connected(&mut st.base);
                    st.base.touch_activity();
                }
                match self.core.encrypt_stream(tcp).await {
                    Ok(stream) => Some(stream),
                    Err(_) => {
                        let mut st = self.core.lock();
                        self.free_buffered_data_locked(&mut st);
                        self.socket_was_closed(&mut st, None);
                        None
                    }
                }
            }
            SocketSlot::Listener(listener) => {
                let tcp = tokio::select! {
                    r = listener.accept() => match r {
                        Ok((tcp, _peer)) => tcp,
                        Err(e) => {
                            let mut st = self.core.lock();
                            self.socket_was_closed(&mut st, Some(e));
                            self.core.log_net_error(&st.base);
                            return None;
                        }
                    },
                    _ = self.wait_cancelled() => return None,
                };
                self.connection_accepted(tcp).await
            }
            SocketSlot::ProxyBind(mut tcp) => {
                let res = tokio::select! {
                    r = proxy::socks5_bind_wait_peer(&mut tcp) => Some(r),
                    _ = self.wait_cancelled() => None,
                };
                match res? {
                    Ok(_peer) => self.connection_accepted(tcp).await,
                    Err(e) => {
                        let mut st = self.core.lock();
                        st.base.net_error = Some(Arc::new(e.to_io_error()));
                        st.base.last_error_from_proxy = true;
                        self.core.log_net_error(&st.base);
                        self.socket_was_closed(&mut st, None);
                        None
                    }
                }
            }
            SocketSlot::Empty => {
                warn!("transfer task started without an established connection");
                None
            }
        }
    }

    async fn wait_cancelled(&self) {
        loop {
            if self.core.lock().base.cancelled {
                return;
            }
            self.core.wake.notified().await;
        }
    }

    async fn connection_accepted(&self, tcp: tokio::net::TcpStream) -> Option<DataStream> {
        match self.core.encrypt_stream(tcp).await {
            Ok(stream) => {
                let mut st = self.core.lock();
                st.base.net_error = None;
                st.base.tls_error = None;
                st.base.touch_activity();
                self.core.just_connected(&mut st.base);
                Some(stream)
            }
            Err(_) => {
                let mut st = self.core.lock();
                self.socket_was_closed(&mut st, None);
                None
            }
        }
    }

    async fn transfer_loop(&self, stream: DataStream) {
        let mut stream = Some(stream);
        {
            let mut st = self.core.lock();
            st.ext.first_write_time = tick_ms();
        }
        let check = self.core.cfg.no_data_check_interval;
        let mut no_data_ticker = tokio::time::interval_at(Instant::now() + check, check);

        loop {
            let mut write_slot: Option<(Vec<u8>, usize)> = None;
            let mut eof_flush = false;
            {
                let mut st = self.core.lock();
                if (st.base.cancelled || st.ext.close_requested) && stream.is_some() {
                    stream = None;
                    st.ext.close_requested = false;
                    self.mark_socket_closed(&mut st);
                }
                if stream.is_none() {
                    return;
                }
                let gated = st.base.paused || !self.may_send(&st);
                if !gated {
                    // ask for more file data whenever the refill buffer is
                    // free and the file is not exhausted
                    if !st.ext.flush_ready && !st.ext.prepare_sent && !st.ext.eof_reached {
                        st.ext.prepare_sent = true;
                        self.core.notifier.post(DataConnEvent::PrepareData);
                    }
                    if st.ext.write_remaining() == 0 && st.ext.flush_ready {
                        self.move_flush_to_write(&mut st);
                    }
                    if st.ext.write_remaining() == 0 && st.ext.eof_reached && !st.ext.flush_ready {
                        // everything up to end-of-file went out; perform the
                        // shutdown after releasing the lock (below)
                        eof_flush = true;
                    }
                    if !eof_flush && st.ext.write_remaining() > 0 {
                        let off = st.ext.write_off;
                        if let Some(buf) = st.ext.write_buf.take() {
                            write_slot = Some((buf, off));
                        }
                    }
                }
            }

            if eof_flush {
                if let Some(mut s) = stream.take() {
                    let _ = s.shutdown().await;
                }
                let mut st = self.core.lock();
                st.ext.closed_on_eof = true;
                self.socket_was_closed(&mut st, None);
                return;
            }

            enum LoopEvent {
                Wake,
                NoDataTick,
                Wrote(io::Result<usize>),
            }

            let event = {
                let write_fut = async {
                    match (&mut stream, &write_slot) {
                        (Some(s), Some((buf, off))) => s.write(&buf[*off..]).await,
                        _ => std::future::pending().await,
                    }
                };
                tokio::select! {
                    biased;
                    _ = self.core.wake.notified() => LoopEvent::Wake,
                    _ = no_data_ticker.tick() => LoopEvent::NoDataTick,
                    w = write_fut => LoopEvent::Wrote(w),
                }
            };

            let mut st = self.core.lock();
            let mut was_discarded = false;
            if let Some((buf, _)) = write_slot.take() {
                if st.ext.write_discard {
                    st.ext.write_discard = false;
                    st.ext.write_off = 0;
                    let mut buf = buf;
                    buf.clear();
                    st.ext.write_buf = Some(buf);
                    was_discarded = true;
                } else {
                    st.ext.write_buf = Some(buf);
                }
            }
            match event {
                LoopEvent::Wake => {}
                LoopEvent::NoDataTick => {
                    if stream.is_some() && self.no_data_timeout_hit(&mut st) {
                        stream = None;
                        self.free_buffered_data_locked(&mut st);
                        self.socket_was_closed(
                            &mut st,
                            Some(io::Error::new(
                                io::ErrorKind::ConnectionReset,
                                "no data transferred within the configured time limit",
                            )),
                        );
                        return;
                    }
                }
                LoopEvent::Wrote(Ok(n)) => {
                    if !was_discarded {
                        self.on_bytes_written(&mut st, n);
                    }
                }
                LoopEvent::Wrote(Err(e)) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        stream = None;
                        self.socket_was_closed(&mut st, Some(e));
                        self.core.log_net_error(&st.base);
                        self.free_buffered_data_locked(&mut st);
                        return;
                    }
                }
            }
        }
    }

    fn may_send(&self, st: &State<UploadState>) -> bool {
        // encrypted passive uploads hold data until the transfer command
        // confirmed the connection and the owner activated it
        if self.core.tls.is_some()
            && matches!(st.base.mode, crate::base::ConnMode::Passive(_))
            && !st.ext.activated
        {
            return false;
        }
        true
    }

    fn on_bytes_written(&self, st: &mut State<UploadState>, n: usize) {
        let remaining = st.ext.write_remaining();
        if n == 0 || remaining == 0 {
            return;
        }
        // under MODE Z map wire bytes back to their logical share
        let logical = if self.core.compress {
            let share = (n as u64 * st.ext.plain_in_write as u64) / remaining as u64;
            st.ext.plain_in_write -= (share as usize).min(st.ext.plain_in_write);
            share
        } else {
            st.ext.plain_in_write = st.ext.plain_in_write.saturating_sub(n);
            n as u64
        };
        st.ext.write_off += n;
        st.ext.total_sent += logical;
        let now = st.base.touch_activity();
        if now.saturating_sub(st.ext.first_write_time) > LOCAL_BUFFER_FILL_MS {
            self.core.speed.add_bytes(logical, now);
            if self.core.compress {
                self.core.compr_speed.add_bytes(n as u64, now);
            }
            if let Some(global) = &st.base.global_speed {
                global.add_bytes(logical, now);
            }
        } else {
            st.ext.skipped_after_connect += logical;
        }

        if st.ext.write_remaining() == 0 {
            if let Some(b) = st.ext.write_buf.as_mut() {
                b.clear();
            }
            st.ext.write_off = 0;
            if st.ext.flush_ready {
                self.move_flush_to_write(st);
            }
        }
    }

    fn no_data_timeout_hit(&self, st: &mut State<UploadState>) -> bool {
        if st.base.paused {
            return false;
        }
        let idle = tick_ms().saturating_sub(st.base.last_activity);
        if Duration::from_millis(idle) < self.core.cfg.no_data_timeout {
            return false;
        }
        st.base.no_data_timeout_hit = true;
        let log_id = st.base.log_id;
        warn!("data connection {log_id}: no data transferred, closing stalled connection");
        true
    }
}

impl Drop for UploadDataConnection {
    fn drop(&mut self) {
        let st = self.core.lock();
        if !st.ext.all_flushed() {
            error!("upload data connection dropped without fully flushed data");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn passive_pair(
        options: UploadConnectionOptions,
    ) -> (
        Arc<UploadDataConnection>,
        mpsc::UnboundedReceiver<DataConnEvent>,
        tokio::net::TcpStream,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (conn, events) = UploadDataConnection::new(DataConnectionConfig::default(), options);
        conn.set_passive(addr, 1);
        conn.passive_connect().await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (conn, events, server)
    }

    /// Feed `data` through the owner-side prepare cycle until the engine
    /// reports the connection closed.
    async fn feed_and_collect(
        conn: Arc<UploadDataConnection>,
        mut events: mpsc::UnboundedReceiver<DataConnEvent>,
        data: &[u8],
        chunk_size: usize,
    ) {
        let mut offset = 0usize;
        while let Some(event) = events.recv().await {
            match event {
                DataConnEvent::PrepareData => {
                    if let Some(mut buf) = conn.give_buffer_for_data() {
                        let end = (offset + chunk_size).min(data.len());
                        buf.extend_from_slice(&data[offset..end]);
                        offset = end;
                        conn.data_buffer_prepared(buf);
                    }
                }
                DataConnEvent::ConnectionClosed => break,
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn plain_upload_round_trip() {
        let (conn, events, mut server) = passive_pair(UploadConnectionOptions::default()).await;
        let data: Vec<u8> = (0..300_000u32).map(|v| (v % 223) as u8).collect();

        let server_task = tokio::spawn(async move {
            let mut received = Vec::new();
            server.read_to_end(&mut received).await.unwrap();
            received
        });

        let runner = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.run().await })
        };
        conn.activate_connection().await;
        feed_and_collect(conn.clone(), events, &data, 50_000).await;
        runner.await.unwrap();

        assert_eq!(server_task.await.unwrap(), data);
        assert!(conn.all_data_transferred());
        assert_eq!(conn.get_total_sent(), data.len() as u64);
        conn.upload_finished();
        assert!(conn.get_error().net_error.is_none());
    }

    #[tokio::test]
    async fn compressed_upload_round_trip() {
        let options = UploadConnectionOptions {
            compress: true,
            ..Default::default()
        };
        let (conn, events, mut server) = passive_pair(options).await;
        let data = b"MODE Z upload sends a deflated stream\n".repeat(10_000);

        let server_task = tokio::spawn(async move {
            let mut received = Vec::new();
            server.read_to_end(&mut received).await.unwrap();
            received
        });

        let runner = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.run().await })
        };
        conn.activate_connection().await;
        feed_and_collect(conn.clone(), events, &data, 70_000).await;
        runner.await.unwrap();

        let wire = server_task.await.unwrap();
        assert!(wire.len() < data.len());
        let unpacked =
            crate::inflate::StreamInflater::inflate_to_end(&wire, 64 * 1024).unwrap();
        assert_eq!(unpacked, data);
        assert!(conn.all_data_transferred());
        // logical bytes, not wire bytes
        assert_eq!(conn.get_total_sent(), data.len() as u64);
    }

    #[tokio::test]
    async fn peer_abort_reports_net_error() {
        let (conn, mut events, server) = passive_pair(UploadConnectionOptions::default()).await;
        // make the peer reset the connection instead of a graceful close
        server.set_linger(Some(Duration::from_secs(0))).unwrap();
        drop(server);

        let runner = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.run().await })
        };
        conn.activate_connection().await;

        let data = vec![1u8; 4 * 1024 * 1024];
        let mut offset = 0usize;
        let mut closed = false;
        while let Some(event) = events.recv().await {
            match event {
                DataConnEvent::PrepareData => {
                    if let Some(mut buf) = conn.give_buffer_for_data() {
                        let end = (offset + 65536).min(data.len());
                        buf.extend_from_slice(&data[offset..end]);
                        offset = end;
                        conn.data_buffer_prepared(buf);
                    }
                }
                DataConnEvent::ConnectionClosed => {
                    closed = true;
                    break;
                }
                _ => {}
            }
        }
        runner.await.unwrap();
        assert!(closed);
        assert!(!conn.all_data_transferred());
        assert!(conn.get_error().net_error.is_some());
    }

    #[tokio::test]
    async fn cancel_discards_buffered_data() {
        let (conn, _events, _server) = passive_pair(UploadConnectionOptions::default()).await;
        let runner = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.run().await })
        };
        conn.activate_connection().await;
        if let Some(mut buf) = conn.give_buffer_for_data() {
            buf.extend_from_slice(&[5u8; 1000]);
            conn.data_buffer_prepared(buf);
        }
        conn.cancel_connection();
        runner.await.unwrap();
        let (transferring, _) = conn.is_transferring();
        assert!(!transferring);
        assert!(!conn.all_data_transferred());
    }
}
