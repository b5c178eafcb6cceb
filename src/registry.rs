//! Named sessions shared by concurrent relay requests

use std::{collections::HashMap, sync::Arc};

use log::{info, warn};
use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::{
    config::ConnectConfig,
    connection::Connection,
    error::{Error, Result},
};

/// What to do when registering a name that is already taken
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RegisterPolicy {
    /// Fail with [`Error::DuplicateName`]
    #[default]
    Reject,
    /// Close the existing session and take its place
    Replace,
}

/// A registered connection. Operations on one session are serialized by its
/// own lock, different sessions never wait on each other.
pub struct Session {
    name: String,
    config: ConnectConfig,
    idn: Option<String>,
    connection: Mutex<Connection>,
}
impl Session {
    pub fn new(
        name: impl Into<String>,
        config: ConnectConfig,
        connection: Connection,
        idn: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            idn,
            connection: Mutex::new(connection),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.config
    }

    /// Identification captured when the session was initialized
    pub fn idn(&self) -> Option<&str> {
        self.idn.as_deref()
    }

    /// Exclusive access to the connection, waiting behind other users
    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.connection.lock().await
    }

    /// Exclusive access to the connection, failing if it is in use
    pub fn try_lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.connection
            .try_lock()
            .map_err(|_| Error::SessionBusy(self.name.clone()))
    }

    async fn close(&self) {
        if let Err(e) = self.lock().await.close().await {
            warn!("Error closing session {}: {e}", self.name);
        }
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}
impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `session` under its name. A rejected session is closed, never
    /// dropped with its transport still open.
    pub async fn register(&self, session: Session, policy: RegisterPolicy) -> Result<Arc<Session>> {
        let session = Arc::new(session);
        let name = session.name().to_string();

        let replaced = {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&name) && policy == RegisterPolicy::Reject {
                None
            } else {
                Some(sessions.insert(name.clone(), session.clone()))
            }
        };
        let Some(replaced) = replaced else {
            session.close().await;
            return Err(Error::DuplicateName(name));
        };

        if let Some(old) = replaced {
            info!("Replacing session {name}");
            old.close().await;
        }

        info!("Registered session {name} ({})", session.config().name());
        Ok(session)
    }

    pub async fn lookup(&self, name: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownName(name.to_string()))
    }

    /// Close and forget a session. An unknown name is not an error, `false` is
    /// returned instead.
    pub async fn unregister(&self, name: &str) -> bool {
        let removed = self.sessions.write().await.remove(name);
        let Some(session) = removed else {
            warn!("Unregistering unknown session {name}");
            return false;
        };

        session.close().await;
        info!("Unregistered session {name}");
        true
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.sessions.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Close every session, used on shutdown
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().collect();
        for (name, session) in sessions {
            session.close().await;
            info!("Closed session {name}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        config::TimeoutPolicy,
        framing::Terminators,
        transport::mock::{Event, MockHandle, MockTransport},
    };

    async fn open_session(name: &str) -> (Session, MockHandle) {
        let (mock, handle) = MockTransport::new();
        let timeouts = TimeoutPolicy::new(Duration::ZERO, Duration::ZERO, Duration::from_secs(2));
        let mut conn = Connection::with_transport(Box::new(mock), Terminators::default(), timeouts);
        conn.open().await.unwrap();
        let session = Session::new(name, ConnectConfig::socket("127.0.0.1", 5025), conn, None);
        (session, handle)
    }

    #[tokio::test]
    async fn register_lookup_unregister() {
        let registry = SessionRegistry::new();
        let (session, handle) = open_session("dc1").await;
        registry.register(session, RegisterPolicy::Reject).await.unwrap();

        assert_eq!(registry.lookup("dc1").await.unwrap().name(), "dc1");
        assert_eq!(registry.names().await, vec!["dc1".to_string()]);

        assert!(registry.unregister("dc1").await);
        assert!(!handle.is_open());
        assert!(registry.is_empty().await);

        /* Second unregister is satisfied already */
        assert!(!registry.unregister("dc1").await);
    }

    #[tokio::test]
    async fn unknown_name_leaves_registry_unchanged() {
        let registry = SessionRegistry::new();
        let (session, _handle) = open_session("dc1").await;
        registry.register(session, RegisterPolicy::Reject).await.unwrap();

        let res = registry.lookup("ghost").await;
        assert!(matches!(res, Err(Error::UnknownName(name)) if name == "ghost"));
        assert_eq!(registry.names().await, vec!["dc1".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_policy() {
        let registry = SessionRegistry::new();
        let (first, first_handle) = open_session("scope").await;
        let (second, second_handle) = open_session("scope").await;
        let (third, _) = open_session("scope").await;

        registry.register(first, RegisterPolicy::Reject).await.unwrap();
        let res = registry.register(second, RegisterPolicy::Reject).await;
        assert!(matches!(res, Err(Error::DuplicateName(_))));
        assert!(first_handle.is_open());
        /* The rejected connection is released, not leaked */
        assert!(!second_handle.is_open());
        assert_eq!(second_handle.count(&Event::Close), 1);

        registry.register(third, RegisterPolicy::Replace).await.unwrap();
        assert!(!first_handle.is_open());
        assert_eq!(first_handle.count(&Event::Close), 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_queries_do_not_interleave() {
        let registry = Arc::new(SessionRegistry::new());
        let (session, handle) = open_session("dmm").await;
        handle.set_write_delay(Duration::from_millis(20));
        handle.respond_with(|cmd| {
            let mut reply = cmd.strip_suffix(b"\r\n").unwrap_or(cmd).to_vec();
            reply.extend_from_slice(b" OK\n");
            vec![reply]
        });
        registry.register(session, RegisterPolicy::Reject).await.unwrap();

        let mut tasks = vec![];
        for i in 0..4 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let cmd = format!("MEAS{i}?");
                let session = registry.lookup("dmm").await.unwrap();
                let reply = session.lock().await.query(cmd.as_bytes()).await.unwrap();
                (cmd, reply)
            }));
        }

        for task in tasks {
            let (cmd, reply) = task.await.unwrap();
            assert_eq!(reply, format!("{cmd} OK").into_bytes());
        }

        /* Every write is immediately followed by its own reply */
        let events: Vec<_> = handle
            .events()
            .into_iter()
            .filter(|ev| matches!(ev, Event::Write(_) | Event::Read(_)))
            .collect();
        assert_eq!(events.len(), 8);
        for pair in events.chunks(2) {
            let (Event::Write(cmd), Event::Read(reply)) = (&pair[0], &pair[1]) else {
                panic!("interleaved events {pair:?}");
            };
            assert!(reply.starts_with(&cmd[..cmd.len() - 2]));
        }
    }

    #[tokio::test]
    async fn busy_session_can_be_refused() {
        let (session, _handle) = open_session("psu").await;
        let guard = session.lock().await;
        assert!(matches!(session.try_lock(), Err(Error::SessionBusy(_))));
        drop(guard);
        assert!(session.try_lock().is_ok());
    }

    #[tokio::test]
    async fn close_all_empties_registry() {
        let registry = SessionRegistry::new();
        let (a, a_handle) = open_session("a").await;
        let (b, b_handle) = open_session("b").await;
        registry.register(a, RegisterPolicy::Reject).await.unwrap();
        registry.register(b, RegisterPolicy::Reject).await.unwrap();

        registry.close_all().await;
        assert!(registry.is_empty().await);
        assert!(!a_handle.is_open() && !b_handle.is_open());
    }
}
