//! In-Process Transport
//!
//! Calls a [`QueryHandler`] directly instead of going through a socket. Used
//! by tests and by single-node setups where the client and server share a
//! process.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::{HostEnv, Message, Transport};
use crate::error::{Error, Result};
use crate::server::{QueryHandler, Session, SessionStep};

/// Transport backed by a shared in-process handler
pub struct HandlerTransport<E: HostEnv> {
    handler: Arc<Mutex<QueryHandler<E>>>,
    session: Session,
    replies: VecDeque<Message>,
    closed: bool,
}

impl<E: HostEnv> HandlerTransport<E> {
    pub fn new(handler: Arc<Mutex<QueryHandler<E>>>) -> Self {
        Self {
            handler,
            session: Session::default(),
            replies: VecDeque::new(),
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl<E: HostEnv + 'static> Transport for HandlerTransport<E> {
    async fn send(&mut self, message: Message) -> Result<()> {
        if self.closed {
            return Err(Error::TransportFailure("session already ended".into()));
        }
        match self.session.step(message) {
            Ok(SessionStep::Query(query)) => {
                let answer = self.handler.lock().handle(query, self.session.cwd());
                self.replies.push_back(answer);
            }
            Ok(SessionStep::Updated) => {}
            Ok(SessionStep::Close) => self.closed = true,
            Err(e) => self.replies.push_back(Message::ErrorAnswer {
                reason: e.to_string(),
            }),
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Message> {
        self.replies
            .pop_front()
            .ok_or_else(|| Error::TransportFailure("no answer pending".into()))
    }
}
