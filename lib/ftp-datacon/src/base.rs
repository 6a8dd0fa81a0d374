/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 the ftp-datacon authors
 */

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::config::DataConnectionConfig;
use crate::event::{DataConnEvent, OwnerNotifier};
use crate::proxy::{self, DataProxyConfig, DataProxyProtocol, ProxyError};
use crate::speed::{SharedTick, TransferSpeedMeter, tick_ms};
use crate::stream::{DataStream, TlsConnectContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnMode {
    Unset,
    /// connect out to a server-supplied endpoint (PASV)
    Passive(SocketAddr),
    /// listen and let the server connect in (PORT)
    Active,
}

/// Where the not-yet-running transfer's socket currently lives.
pub(crate) enum SocketSlot {
    Empty,
    /// established passive connection waiting for the transfer task
    Stream(TcpStream),
    /// local listener waiting for the server to connect in
    Listener(TcpListener),
    /// SOCKS5 BIND control stream; the second reply turns it into the
    /// data transport
    ProxyBind(TcpStream),
}

/// Fields common to all data connection flavors, guarded by the one
/// connection lock together with the machine-specific extension.
pub(crate) struct BaseState {
    pub mode: ConnMode,
    pub log_id: u32,
    /// the connection was opened (connect or accept) at some point; says
    /// nothing about its current state
    pub received_connected: bool,
    /// the connection is open right now
    pub connected_now: bool,
    pub net_error: Option<Arc<io::Error>>,
    pub tls_error: Option<Arc<io::Error>>,
    /// the recorded net error was reported by the proxy
    pub last_error_from_proxy: bool,
    pub no_data_timeout_hit: bool,
    pub last_activity: u64,
    pub socket_close_time: u64,
    pub listen_addr: Option<SocketAddr>,
    /// the one automatic passive reconnect was already used
    pub passive_retry_done: bool,
    pub paused: bool,
    pub cancelled: bool,
    pub sock: SocketSlot,
    pub global_speed: Option<Arc<TransferSpeedMeter>>,
    pub global_activity: Option<Arc<SharedTick>>,
}

impl BaseState {
    fn new() -> Self {
        let now = tick_ms();
        BaseState {
            mode: ConnMode::Unset,
            log_id: 0,
            received_connected: false,
            connected_now: false,
            net_error: None,
            tls_error: None,
            last_error_from_proxy: false,
            no_data_timeout_hit: false,
            last_activity: now,
            socket_close_time: now,
            listen_addr: None,
            passive_retry_done: false,
            paused: false,
            cancelled: false,
            sock: SocketSlot::Empty,
            global_speed: None,
            global_activity: None,
        }
    }

    pub(crate) fn touch_activity(&mut self) -> u64 {
        let now = tick_ms();
        self.last_activity = now;
        if let Some(shared) = &self.global_activity {
            shared.set(now);
        }
        now
    }
}

pub(crate) struct State<X> {
    pub base: BaseState,
    pub ext: X,
}

/// Per-attempt state of the machine-specific extension, reset before every
/// connect/listen attempt.
pub(crate) trait AttemptReset {
    fn clear_before_connect(&mut self);
}

/// Shared plumbing of the download and upload data connections: passive and
/// active establishment, proxy traversal, TLS activation, activity tracking
/// and owner notification.
pub(crate) struct ConnCore<X> {
    pub cfg: DataConnectionConfig,
    pub compress: bool,
    pub tls: Option<TlsConnectContext>,
    pub proxy: Option<DataProxyConfig>,
    pub notifier: OwnerNotifier,
    /// logical bytes per second of this connection
    pub speed: TransferSpeedMeter,
    /// wire bytes per second, tracked separately under MODE Z
    pub compr_speed: TransferSpeedMeter,
    /// wakes the transfer task after owner-side state changes
    pub wake: Notify,
    pub state: Mutex<State<X>>,
}

impl<X: AttemptReset> ConnCore<X> {
    pub(crate) fn new(
        cfg: DataConnectionConfig,
        compress: bool,
        tls: Option<TlsConnectContext>,
        proxy: Option<DataProxyConfig>,
        notifier: OwnerNotifier,
        ext: X,
    ) -> Self {
        ConnCore {
            cfg,
            compress,
            tls,
            proxy,
            notifier,
            speed: TransferSpeedMeter::new(),
            compr_speed: TransferSpeedMeter::new(),
            wake: Notify::new(),
            state: Mutex::new(State {
                base: BaseState::new(),
                ext,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State<X>> {
        self.state.lock().unwrap()
    }

    /// Reset everything that is only valid for one connection attempt.
    pub(crate) fn clear_attempt(&self, st: &mut State<X>) {
        st.ext.clear_before_connect();
        self.speed.clear();
        if self.compress {
            self.compr_speed.clear();
        }
        st.base.net_error = None;
        st.base.tls_error = None;
        st.base.last_error_from_proxy = false;
        st.base.no_data_timeout_hit = false;
        st.base.received_connected = false;
    }

    /// Record the endpoint for passive mode. No I/O happens here.
    pub(crate) fn set_passive(&self, server: SocketAddr, log_id: u32) {
        let mut st = self.lock();
        st.base.mode = ConnMode::Passive(server);
        st.base.log_id = log_id;
        st.base.passive_retry_done = false;
        // the owner sends the transfer command right after this, with its
        // own (shorter or equal) timeout
        st.base.touch_activity();
    }

    /// Switch to active mode; the listener is opened separately via
    /// `open_for_listening`.
    pub(crate) fn set_active(&self, log_id: u32) {
        let mut st = self.lock();
        st.base.mode = ConnMode::Active;
        st.base.log_id = log_id;
        self.clear_attempt(&mut st);
        st.base.touch_activity();
    }

    /// Connect out to the recorded passive endpoint, optionally through the
    /// configured proxy. On failure the sticky net error is recorded and the
    /// caller decides whether to retry (see `activate_connection`).
    pub(crate) async fn passive_connect(&self) -> io::Result<()> {
        let (server, log_id) = {
            let mut st = self.lock();
            let ConnMode::Passive(server) = st.base.mode else {
                warn!("passive_connect() called while not in passive mode");
                return Err(io::Error::other("not in passive mode"));
            };
            self.clear_attempt(&mut st);
            (server, st.base.log_id)
        };

        let res = timeout(self.cfg.connect_timeout, self.connect_stream(server)).await;
        let res = match res {
            Ok(res) => res,
            Err(_) => Err((
                io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                false,
            )),
        };
        match res {
            Ok(tcp) => {
                let mut st = self.lock();
                st.base.sock = SocketSlot::Stream(tcp);
                st.base.touch_activity();
                Ok(())
            }
            Err((e, from_proxy)) => {
                let mut st = self.lock();
                let e = Arc::new(e);
                st.base.net_error = Some(e.clone());
                st.base.last_error_from_proxy = from_proxy;
                if from_proxy {
                    warn!(
                        "data connection {log_id}: unable to connect through proxy {}: {e}",
                        self.proxy.as_ref().map(|p| p.addr.to_string()).unwrap_or_default()
                    );
                } else {
                    warn!("data connection {log_id}: unable to open connection to {server}: {e}");
                }
                Err(io::Error::new(e.kind(), e.to_string()))
            }
        }
    }

    async fn connect_stream(
        &self,
        server: SocketAddr,
    ) -> Result<TcpStream, (io::Error, bool)> {
        match &self.proxy {
            Some(proxy) => {
                let mut tcp = TcpStream::connect(proxy.addr)
                    .await
                    .map_err(|e| (e, false))?;
                let res = match proxy.protocol {
                    DataProxyProtocol::Socks5 => {
                        proxy::socks5_connect(&mut tcp, proxy, server).await
                    }
                    DataProxyProtocol::HttpConnect => {
                        proxy::http_connect(&mut tcp, proxy, server).await
                    }
                };
                match res {
                    Ok(()) => Ok(tcp),
                    Err(e) => Err((e.to_io_error(), true)),
                }
            }
            None => TcpStream::connect(server).await.map_err(|e| (e, false)),
        }
    }

    /// Called when the data transfer is about to start. Some servers refuse
    /// the very first passive connect transiently; if that happened, exactly
    /// one automatic reconnect is issued here. In active mode this is a
    /// no-op.
    pub(crate) async fn activate_connection(&self) {
        let retry = {
            let mut st = self.lock();
            let retry = matches!(st.base.mode, ConnMode::Passive(_))
                && !st.base.received_connected
                && st.base.net_error.is_some()
                && !st.base.passive_retry_done;
            if retry {
                st.base.passive_retry_done = true;
            }
            retry
        };
        if retry {
            let log_id = self.lock().base.log_id;
            debug!("data connection {log_id}: retrying refused passive connection");
            let _ = self.passive_connect().await;
        }
    }

    /// Open the endpoint the server will connect back to: a local listener,
    /// or a proxy-side one negotiated via SOCKS5 BIND. Returns the address
    /// to advertise via PORT/EPRT. `expected_peer` is the server address a
    /// proxy may use to filter the inbound connection.
    pub(crate) async fn open_for_listening(
        &self,
        local_addr: SocketAddr,
        expected_peer: SocketAddr,
    ) -> io::Result<SocketAddr> {
        match &self.proxy {
            None => match TcpListener::bind(local_addr).await {
                Ok(listener) => {
                    let addr = listener.local_addr()?;
                    let mut st = self.lock();
                    st.base.sock = SocketSlot::Listener(listener);
                    self.listening_for_connection(&mut st.base, Some(addr));
                    Ok(addr)
                }
                Err(e) => {
                    let mut st = self.lock();
                    st.base.net_error = Some(Arc::new(io::Error::new(e.kind(), e.to_string())));
                    self.listening_for_connection(&mut st.base, None);
                    Err(e)
                }
            },
            Some(proxy) => {
                let res = self.proxy_bind(proxy, expected_peer).await;
                match res {
                    Ok((tcp, addr)) => {
                        let mut st = self.lock();
                        st.base.sock = SocketSlot::ProxyBind(tcp);
                        self.listening_for_connection(&mut st.base, Some(addr));
                        Ok(addr)
                    }
                    Err(e) => {
                        let e_io = e.to_io_error();
                        let mut st = self.lock();
                        st.base.net_error =
                            Some(Arc::new(io::Error::new(e_io.kind(), e_io.to_string())));
                        st.base.last_error_from_proxy = true;
                        self.listening_for_connection(&mut st.base, None);
                        Err(e_io)
                    }
                }
            }
        }
    }

    async fn proxy_bind(
        &self,
        proxy: &DataProxyConfig,
        expected_peer: SocketAddr,
    ) -> Result<(TcpStream, SocketAddr), ProxyError> {
        if proxy.protocol != DataProxyProtocol::Socks5 {
            return Err(ProxyError::ListenNotSupported);
        }
        let mut tcp = TcpStream::connect(proxy.addr).await?;
        let addr = proxy::socks5_bind(&mut tcp, proxy, expected_peer).await?;
        Ok((tcp, addr))
    }

    /// Record the listen endpoint (or clear it on error) and tell the owner
    /// that PORT/EPRT can now be sent.
    pub(crate) fn listening_for_connection(
        &self,
        base: &mut BaseState,
        addr: Option<SocketAddr>,
    ) {
        base.listen_addr = addr;
        self.notifier.post(DataConnEvent::ListeningForConnection);
    }

    pub(crate) fn get_listen_addr(&self) -> Option<SocketAddr> {
        self.lock().base.listen_addr
    }

    /// `(transferring, transfer_finished)`: whether the connection is open
    /// for data right now, and whether an established connection has since
    /// closed.
    pub(crate) fn is_transferring(&self) -> (bool, bool) {
        let st = self.lock();
        let connected = st.base.connected_now;
        (
            st.base.received_connected && connected,
            st.base.received_connected && !connected,
        )
    }

    pub(crate) fn get_last_activity_time(&self) -> u64 {
        self.lock().base.last_activity
    }

    pub(crate) fn get_socket_close_time(&self) -> u64 {
        self.lock().base.socket_close_time
    }

    pub(crate) fn get_log_id(&self) -> u32 {
        self.lock().base.log_id
    }

    pub(crate) fn set_global_transfer_speed_meter(&self, meter: Option<Arc<TransferSpeedMeter>>) {
        self.lock().base.global_speed = meter;
    }

    pub(crate) fn set_global_last_activity_time(&self, shared: Option<Arc<SharedTick>>) {
        self.lock().base.global_activity = shared;
    }

    /// The connection is established; start metering and tell the owner.
    /// The transfer task arms the no-data-transfer timer right after this.
    pub(crate) fn just_connected(&self, base: &mut BaseState) {
        base.received_connected = true;
        base.connected_now = true;
        self.speed.just_connected();
        if self.compress {
            self.compr_speed.just_connected();
        }
        self.notifier.post(DataConnEvent::ConnectedToServer);
    }

    /// TLS-wrap an established connection if encryption was requested. A
    /// handshake failure records the sticky TLS error; the transfer cannot
    /// proceed without the requested security guarantee.
    pub(crate) async fn encrypt_stream(&self, tcp: TcpStream) -> io::Result<DataStream> {
        match &self.tls {
            None => Ok(DataStream::plain(tcp)),
            Some(ctx) => match ctx.handshake(tcp).await {
                Ok(tls) => Ok(DataStream::tls(tls)),
                Err(e) => {
                    let mut st = self.lock();
                    let log_id = st.base.log_id;
                    warn!("data connection {log_id}: TLS handshake failed: {e}");
                    st.base.tls_error = Some(Arc::new(io::Error::new(e.kind(), e.to_string())));
                    Err(e)
                }
            },
        }
    }

    pub(crate) fn log_net_error(&self, base: &BaseState) {
        if let Some(e) = &base.net_error {
            let log_id = base.log_id;
            if base.last_error_from_proxy {
                warn!("data connection {log_id}: proxy reported error: {e}");
            } else {
                warn!("data connection {log_id}: error: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoExt;
    impl AttemptReset for NoExt {
        fn clear_before_connect(&mut self) {}
    }

    fn test_core() -> ConnCore<NoExt> {
        let (notifier, _rx) = OwnerNotifier::new();
        ConnCore::new(
            DataConnectionConfig::default(),
            false,
            None,
            None,
            notifier,
            NoExt,
        )
    }

    #[tokio::test]
    async fn passive_connect_records_error() {
        let core = test_core();
        // nothing listens on this port
        core.set_passive("127.0.0.1:1".parse().unwrap(), 7);
        assert!(core.passive_connect().await.is_err());
        let st = core.lock();
        assert!(st.base.net_error.is_some());
        assert!(!st.base.received_connected);
    }

    #[tokio::test]
    async fn passive_retry_exactly_once() {
        let core = test_core();
        core.set_passive("127.0.0.1:1".parse().unwrap(), 7);
        assert!(core.passive_connect().await.is_err());

        // first activation retries (and fails again)
        core.activate_connection().await;
        assert!(core.lock().base.passive_retry_done);
        assert!(core.lock().base.net_error.is_some());

        // second activation must not issue a third attempt: swap in a live
        // listener and verify no connection arrives
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        {
            let mut st = core.lock();
            st.base.mode = ConnMode::Passive(addr);
        }
        core.activate_connection().await;
        let accept = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            listener.accept(),
        )
        .await;
        assert!(accept.is_err(), "unexpected third connect attempt");
    }

    #[tokio::test]
    async fn set_passive_rearms_retry() {
        let core = test_core();
        core.set_passive("127.0.0.1:1".parse().unwrap(), 7);
        assert!(core.passive_connect().await.is_err());
        core.activate_connection().await;
        assert!(core.lock().base.passive_retry_done);
        core.set_passive("127.0.0.1:1".parse().unwrap(), 7);
        assert!(!core.lock().base.passive_retry_done);
    }

    #[tokio::test]
    async fn successful_passive_connect_stores_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let core = test_core();
        core.set_passive(addr, 1);
        core.passive_connect().await.unwrap();
        let st = core.lock();
        assert!(matches!(st.base.sock, SocketSlot::Stream(_)));
        assert!(st.base.net_error.is_none());
    }

    #[tokio::test]
    async fn open_for_listening_direct() {
        let core = test_core();
        core.set_active(3);
        let addr = core
            .open_for_listening(
                "127.0.0.1:0".parse().unwrap(),
                "192.0.2.1:21".parse().unwrap(),
            )
            .await
            .unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(core.get_listen_addr(), Some(addr));
    }
}
