//! Connection groups and per-origin server knowledge.
//!
//! A [`ConnectionGroup`] holds the connections for one origin, proxy and
//! optional caller-chosen group name. A [`ServicePoint`] remembers what
//! was learned about one origin (HTTP behaviour, `100 Continue` support,
//! lease timeout) and is shared by every group that talks to it.

use crate::base::neterror::NetError;
use crate::http::framer::HttpBehaviour;
use crate::socket::connection::Connection;
use crate::socket::connectjob::{ConnectTarget, Connector};
use crate::urlrequest::context::EngineConfig;
use crate::urlrequest::request::Request;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// What is known about one origin.
#[derive(Debug)]
pub struct ServicePoint {
    behaviour: AtomicU8,
    understands_100_continue: AtomicBool,
    lease_timeout: RwLock<Option<Duration>>,
    max_idle_time: Duration,
}

impl ServicePoint {
    pub fn new(max_idle_time: Duration) -> Self {
        Self {
            behaviour: AtomicU8::new(HttpBehaviour::Unknown as u8),
            understands_100_continue: AtomicBool::new(true),
            lease_timeout: RwLock::new(None),
            max_idle_time,
        }
    }

    pub fn behaviour(&self) -> HttpBehaviour {
        HttpBehaviour::from_u8(self.behaviour.load(Ordering::Acquire))
    }

    pub fn set_behaviour(&self, behaviour: HttpBehaviour) {
        self.behaviour.store(behaviour as u8, Ordering::Release);
    }

    pub fn supports_pipelining(&self) -> bool {
        self.behaviour().supports_pipelining()
    }

    pub fn supports_chunked_upload(&self) -> bool {
        self.behaviour().supports_chunked_upload()
    }

    pub fn understands_100_continue(&self) -> bool {
        self.understands_100_continue.load(Ordering::Acquire)
    }

    pub fn set_understands_100_continue(&self) {
        self.understands_100_continue.store(true, Ordering::Release);
    }

    /// The server let the continue timer run out. Later requests skip
    /// `Expect: 100-continue` until a `100` is seen again.
    pub fn clear_understands_100_continue(&self) {
        self.understands_100_continue.store(false, Ordering::Release);
    }

    /// Connections older than this stop being reused.
    pub fn lease_timeout(&self) -> Option<Duration> {
        *self.lease_timeout.read()
    }

    pub fn set_lease_timeout(&self, timeout: Option<Duration>) {
        *self.lease_timeout.write() = timeout;
    }

    pub fn max_idle_time(&self) -> Duration {
        self.max_idle_time
    }
}

/// Identifies a connection group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Proxy URL, if any.
    pub proxy: Option<String>,
    pub group_name: Option<String>,
}

impl GroupKey {
    pub fn new(target: &ConnectTarget, group_name: Option<&str>) -> Self {
        Self {
            scheme: target.scheme.clone(),
            host: target.host.to_ascii_lowercase(),
            port: target.port,
            proxy: target.proxy.as_ref().map(|p| p.url.to_string()),
            group_name: group_name.map(str::to_string),
        }
    }

    /// The service point key ignores the group name.
    fn origin(&self) -> GroupKey {
        GroupKey { group_name: None, ..self.clone() }
    }
}

/// Connections sharing one key.
#[derive(Debug)]
pub struct ConnectionGroup {
    key: GroupKey,
    service_point: Arc<ServicePoint>,
    connections: Mutex<Vec<Arc<Connection>>>,
    busy: AtomicUsize,
}

impl ConnectionGroup {
    fn new(key: GroupKey, service_point: Arc<ServicePoint>) -> Self {
        Self { key, service_point, connections: Mutex::new(Vec::new()), busy: AtomicUsize::new(0) }
    }

    pub fn key(&self) -> &GroupKey {
        &self.key
    }

    pub fn service_point(&self) -> &Arc<ServicePoint> {
        &self.service_point
    }

    pub(crate) fn enter_busy(&self) {
        self.busy.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn leave_busy(&self) {
        let _ = self.busy.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Connections with queued or in-flight requests.
    pub fn busy_count(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    pub(crate) fn remove(&self, id: u64) {
        self.connections.lock().retain(|c| c.id() != id);
    }

    /// Pick a connection for `request_id` and reserve a slot on it.
    ///
    /// Preference: a free connection, then a new one while under `limit`,
    /// then the least busy connection that would accept the request, then
    /// a new one regardless of the limit.
    fn select<F>(&self, request_id: u64, limit: usize, create: F) -> Arc<Connection>
    where
        F: FnOnce() -> Arc<Connection>,
    {
        let mut conns = self.connections.lock();
        conns.retain(|c| !c.is_closed());

        let mut least_busy: Option<(usize, &Arc<Connection>)> = None;
        let mut free = None;
        for conn in conns.iter() {
            let snap = conn.snapshot();
            if !snap.accepts(request_id) {
                continue;
            }
            if snap.free {
                free = Some(conn);
                break;
            }
            if least_busy.map_or(true, |(busy, _)| snap.busy < busy) {
                least_busy = Some((snap.busy, conn));
            }
        }

        let chosen = match (free, least_busy) {
            (Some(conn), _) => Arc::clone(conn),
            (None, Some((_, conn))) if conns.len() >= limit => Arc::clone(conn),
            _ => {
                let conn = create();
                tracing::debug!(
                    conn = conn.id(),
                    host = %self.key.host,
                    port = self.key.port,
                    open = conns.len() + 1,
                    "new connection"
                );
                conns.push(Arc::clone(&conn));
                conn
            }
        };
        chosen.reserve();
        chosen
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().clone()
    }
}

/// All connection groups of one engine.
pub struct ConnectionPool {
    groups: Arc<DashMap<GroupKey, Arc<ConnectionGroup>>>,
    service_points: Arc<DashMap<GroupKey, Arc<ServicePoint>>>,
    connector: Arc<dyn Connector>,
    config: Arc<EngineConfig>,
    next_conn_id: AtomicU64,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("groups", &self.groups.len())
            .field("max_connections_per_group", &self.config.max_connections_per_group)
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, config: Arc<EngineConfig>) -> Self {
        Self {
            groups: Arc::new(DashMap::new()),
            service_points: Arc::new(DashMap::new()),
            connector,
            config,
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// Shared knowledge about the origin behind `target`.
    pub fn service_point(&self, target: &ConnectTarget) -> Arc<ServicePoint> {
        self.service_point_for(&GroupKey::new(target, None))
    }

    fn service_point_for(&self, key: &GroupKey) -> Arc<ServicePoint> {
        let max_idle = self.config.max_idle_time;
        let sp = self
            .service_points
            .entry(key.origin())
            .or_insert_with(|| {
                let sp = ServicePoint::new(max_idle);
                sp.set_lease_timeout(self.config.lease_timeout);
                Arc::new(sp)
            });
        Arc::clone(sp.value())
    }

    fn group(&self, key: GroupKey) -> Arc<ConnectionGroup> {
        if let Some(group) = self.groups.get(&key) {
            return Arc::clone(group.value());
        }
        let sp = self.service_point_for(&key);
        let group = self
            .groups
            .entry(key.clone())
            .or_insert_with(|| Arc::new(ConnectionGroup::new(key, sp)));
        Arc::clone(group.value())
    }

    fn create_connection(&self, group: &Arc<ConnectionGroup>, target: &ConnectTarget) -> Arc<Connection> {
        Connection::new(
            self.next_conn_id.fetch_add(1, Ordering::Relaxed),
            target.clone(),
            Arc::clone(&self.connector),
            Arc::clone(&group.service_point),
            Arc::downgrade(group),
            Arc::clone(&self.config),
        )
    }

    /// Submit `request` to a connection in its group.
    ///
    /// A connection the request is pinned to for an auth handshake is
    /// tried first. Otherwise connections are selected until one accepts.
    pub fn find_connection(
        &self,
        request: &Arc<Request>,
        leg: u64,
        target: &ConnectTarget,
    ) -> Result<Arc<Connection>, NetError> {
        let affinity = request.state().affinity.as_ref().and_then(Weak::upgrade);
        if let Some(conn) = affinity {
            conn.reserve();
            if conn.submit_request(request, leg, true) {
                return Ok(conn);
            }
            tracing::debug!(conn = conn.id(), request = request.id(), "pinned connection refused request");
        }

        let key = GroupKey::new(target, request.options().connection_group.as_deref());
        let group = self.group(key);
        loop {
            if request.is_aborted() {
                return Err(request.abort_error());
            }
            let conn = group.select(request.id(), self.config.max_connections_per_group, || {
                self.create_connection(&group, target)
            });
            if conn.submit_request(request, leg, false) {
                return Ok(conn);
            }
        }
    }

    /// Close connections idle past their service point's limit and drop
    /// empty groups.
    pub fn cleanup_idle_connections(&self) {
        let now = Instant::now();
        let groups: Vec<Arc<ConnectionGroup>> = self.groups.iter().map(|g| Arc::clone(g.value())).collect();
        let mut closed = 0usize;
        for group in &groups {
            for conn in group.snapshot() {
                if conn.close_if_expired(now) {
                    closed += 1;
                }
            }
        }
        self.groups.retain(|_, g| !g.is_empty());
        if closed > 0 {
            tracing::debug!(closed, "idle connections closed");
        }
    }

    /// Start a background task to periodically clean up idle connections.
    /// Should be called once during initialization.
    pub fn start_cleanup_task(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let interval = self.config.cleanup_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(pool) = pool.upgrade() else {
                    return;
                };
                pool.cleanup_idle_connections();
            }
        });
    }

    /// Close every connection.
    pub fn close_all(&self) {
        let groups: Vec<Arc<ConnectionGroup>> = self.groups.iter().map(|g| Arc::clone(g.value())).collect();
        for group in groups {
            for conn in group.snapshot() {
                conn.handle_error(NetError::ConnectionAborted);
            }
        }
        self.groups.clear();
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Open connections across all groups.
    pub fn connection_count(&self) -> usize {
        self.groups.iter().map(|g| g.len()).sum()
    }

    /// Connections with work queued, across all groups.
    pub fn busy_count(&self) -> usize {
        self.groups.iter().map(|g| g.busy_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::requestbody::RequestBody;
    use crate::socket::connectjob::ConnectFuture;
    use crate::socket::proxy::ProxySettings;
    use crate::urlrequest::request::RequestOptions;
    use http::{HeaderMap, Method};
    use url::Url;

    struct NeverConnector;

    impl Connector for NeverConnector {
        fn connect<'a>(&'a self, _target: &'a ConnectTarget) -> ConnectFuture<'a> {
            Box::pin(async { Err(NetError::ConnectionRefused) })
        }
    }

    fn pool(config: EngineConfig) -> ConnectionPool {
        ConnectionPool::new(Arc::new(NeverConnector), Arc::new(config))
    }

    fn target() -> ConnectTarget {
        ConnectTarget { scheme: "http".into(), host: "example.com".into(), port: 80, proxy: None }
    }

    fn request(opts: RequestOptions) -> (Arc<Request>, u64) {
        let req = Request::new(
            Method::POST,
            Url::parse("http://example.com/").unwrap(),
            HeaderMap::new(),
            "x".into(),
            opts,
        );
        let leg = req.begin_leg();
        (req, leg)
    }

    #[test]
    fn test_group_key_includes_proxy_and_name() {
        let direct = GroupKey::new(&target(), None);
        let named = GroupKey::new(&target(), Some("batch"));
        let mut proxied_target = target();
        proxied_target.proxy = ProxySettings::new("http://proxy:3128");
        let proxied = GroupKey::new(&proxied_target, None);

        assert_ne!(direct, named);
        assert_ne!(direct, proxied);
        assert_eq!(named.origin(), direct);
    }

    #[test]
    fn test_service_point_shared_across_group_names() {
        let pool = pool(EngineConfig::default());
        let a = pool.service_point_for(&GroupKey::new(&target(), Some("a")));
        let b = pool.service_point(&target());
        assert!(Arc::ptr_eq(&a, &b));
        a.set_behaviour(HttpBehaviour::Http10);
        assert!(!b.supports_pipelining());
    }

    #[test]
    fn test_opens_up_to_limit_then_queues() {
        let config = EngineConfig { max_connections_per_group: 2, ..EngineConfig::default() };
        let pool = pool(config);
        let opts = RequestOptions::from_config(pool.config());

        let conns: Vec<_> = (0..5)
            .map(|_| {
                let (req, leg) = request(opts.clone());
                pool.find_connection(&req, leg, &target()).unwrap()
            })
            .collect();

        assert_eq!(pool.connection_count(), 2);
        assert_eq!(pool.busy_count(), 2);
        assert_ne!(conns[0].id(), conns[1].id());
        // Requests beyond the limit go to the least busy connection.
        let (a_on_wire, a_waiting) = conns[0].queue_lengths();
        let (b_on_wire, b_waiting) = conns[1].queue_lengths();
        assert_eq!(a_on_wire + b_on_wire, 2);
        assert_eq!(a_waiting + b_waiting, 3);
    }

    #[test]
    fn test_group_name_separates_connections() {
        let pool = pool(EngineConfig::default());
        let mut opts = RequestOptions::from_config(pool.config());
        let (a, leg_a) = request(opts.clone());
        opts.connection_group = Some("other".into());
        let (b, leg_b) = request(opts);

        let ca = pool.find_connection(&a, leg_a, &target()).unwrap();
        let cb = pool.find_connection(&b, leg_b, &target()).unwrap();
        assert_ne!(ca.id(), cb.id());
        assert_eq!(pool.group_count(), 2);
    }

    #[test]
    fn test_aborted_request_is_not_submitted() {
        let pool = pool(EngineConfig::default());
        let (req, leg) = request(RequestOptions::from_config(pool.config()));
        req.abort();
        assert_eq!(pool.find_connection(&req, leg, &target()).unwrap_err(), NetError::RequestCanceled);
        assert_eq!(pool.connection_count(), 0);
    }

    #[test]
    fn test_cleanup_keeps_busy_connections() {
        let config = EngineConfig { max_idle_time: Duration::ZERO, ..EngineConfig::default() };
        let pool = pool(config);
        let (req, leg) = request(RequestOptions::from_config(pool.config()));
        let conn = pool.find_connection(&req, leg, &target()).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        pool.cleanup_idle_connections();
        assert_eq!(pool.connection_count(), 1);
        assert!(!conn.is_closed());

        conn.close_socket();
        pool.cleanup_idle_connections();
        assert_eq!(pool.connection_count(), 0);
        assert_eq!(pool.group_count(), 0);
    }

    #[test]
    fn test_close_all_empties_pool() {
        let pool = pool(EngineConfig::default());
        let (req, leg) = request(RequestOptions::from_config(pool.config()));
        pool.find_connection(&req, leg, &target()).unwrap();
        assert_eq!(pool.connection_count(), 1);
        pool.close_all();
        assert_eq!(pool.connection_count(), 0);
        assert!(req.has_outcome(leg));
    }
}
