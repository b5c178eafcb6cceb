//! Scripted in-memory transport for tests

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::{
    config::TimeoutPolicy,
    error::{Error, Result},
};

use super::Transport;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Open,
    Close,
    Write(Vec<u8>),
    Read(Vec<u8>),
}

#[derive(Default)]
struct State {
    open: bool,
    events: Vec<Event>,
    pending: VecDeque<Vec<u8>>,
    responder: Option<Responder>,
    write_delay: Option<Duration>,
    fail_open: bool,
}

/// Test handle onto a [`MockTransport`] that has been moved into a connection
#[derive(Clone, Default)]
pub struct MockHandle {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}
impl MockHandle {
    /// Queue bytes for the next reads
    pub fn push_read(&self, data: impl AsRef<[u8]>) {
        self.state
            .lock()
            .unwrap()
            .pending
            .push_back(data.as_ref().to_vec());
        self.notify.notify_one();
    }

    /// Answer every write with the chunks returned by `f`
    pub fn respond_with(&self, f: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static) {
        self.state.lock().unwrap().responder = Some(Box::new(f));
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.state.lock().unwrap().write_delay = Some(delay);
    }

    pub fn fail_open(&self) {
        self.state.lock().unwrap().fail_open = true;
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|ev| match ev {
                Event::Write(data) => Some(data),
                _ => None,
            })
            .collect()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    pub fn count(&self, event: &Event) -> usize {
        self.events().iter().filter(|ev| *ev == event).count()
    }
}

pub struct MockTransport {
    handle: MockHandle,
}
impl MockTransport {
    pub fn new() -> (Self, MockHandle) {
        let handle = MockHandle::default();
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}
#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self, _timeouts: &TimeoutPolicy) -> Result<()> {
        let mut state = self.handle.state.lock().unwrap();
        if state.fail_open {
            return Err(Error::Connect("mock refused".into()));
        }
        state.open = true;
        state.events.push(Event::Open);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.handle.state.lock().unwrap();
        state.open = false;
        state.events.push(Event::Close);
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let delay = self.handle.state.lock().unwrap().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.handle.state.lock().unwrap();
        state.events.push(Event::Write(data.to_vec()));
        if let Some(responder) = state.responder.as_mut() {
            let replies = responder(data);
            state.pending.extend(replies);
            self.handle.notify.notify_one();
        }
        Ok(())
    }

    async fn read(&mut self, max_len: usize) -> Result<Vec<u8>> {
        loop {
            let notified = self.handle.notify.notified();
            {
                let mut state = self.handle.state.lock().unwrap();
                if let Some(mut chunk) = state.pending.pop_front() {
                    if chunk.len() > max_len {
                        let rest = chunk.split_off(max_len);
                        state.pending.push_front(rest);
                    }
                    state.events.push(Event::Read(chunk.clone()));
                    return Ok(chunk);
                }
            }
            notified.await;
        }
    }

    fn describe(&self) -> String {
        "mock".into()
    }
}
