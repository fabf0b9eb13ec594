//! The per-graph readiness reactor.
//!
//! Sinks whose blocking API is file-descriptor-based register their fd
//! here with writable interest. When the fd becomes writable, the owning
//! component's servant is nudged; the component itself never blocks inside
//! the poll loop.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::il::{ComponentHandle, IlError, PortIndex};

const WAKER: Token = Token(0);
const FIRST_FD_TOKEN: usize = 1;

enum ReactorOp {
    Register {
        fd: RawFd,
        component: ComponentHandle,
        port: PortIndex,
    },
    Deregister {
        fd: RawFd,
    },
    Shutdown,
}

/// A handle for registering fds with the reactor. Cloneable; safe to call
/// from inside processor callbacks (it only posts to the reactor thread).
#[derive(Clone)]
pub struct ReactorHandle {
    ops: Sender<ReactorOp>,
    waker: Arc<Waker>,
}

impl std::fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorHandle").finish_non_exhaustive()
    }
}

impl ReactorHandle {
    /// Registers an fd with writable interest. Each writability edge nudges
    /// `component`'s servant for `port`.
    pub fn register_writable(
        &self,
        fd: RawFd,
        component: ComponentHandle,
        port: PortIndex,
    ) -> Result<(), IlError> {
        self.ops
            .send(ReactorOp::Register {
                fd,
                component,
                port,
            })
            .map_err(|_| IlError::Disconnected)?;
        self.waker.wake().map_err(|_| IlError::Disconnected)
    }

    /// Removes an fd from the poll set.
    pub fn deregister(&self, fd: RawFd) -> Result<(), IlError> {
        self.ops
            .send(ReactorOp::Deregister { fd })
            .map_err(|_| IlError::Disconnected)?;
        self.waker.wake().map_err(|_| IlError::Disconnected)
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.ops.send(ReactorOp::Shutdown);
        let _ = self.waker.wake();
    }
}

/// The reactor thread and its registry.
pub(crate) struct Reactor {
    poll: Poll,
    ops: Receiver<ReactorOp>,
    entries: HashMap<Token, (RawFd, ComponentHandle, PortIndex)>,
    next_token: usize,
}

impl Reactor {
    /// Starts the reactor thread and returns its handle plus the join
    /// handle for teardown.
    pub(crate) fn spawn() -> Result<(ReactorHandle, JoinHandle<()>), IlError> {
        let poll = Poll::new()
            .map_err(|e| IlError::InsufficientResources(format!("creating poll: {e}")))?;
        let waker = Arc::new(
            Waker::new(poll.registry(), WAKER)
                .map_err(|e| IlError::InsufficientResources(format!("creating waker: {e}")))?,
        );

        let (tx, rx) = channel();
        let mut reactor = Reactor {
            poll,
            ops: rx,
            entries: HashMap::new(),
            next_token: FIRST_FD_TOKEN,
        };

        let thread = std::thread::Builder::new()
            .name("graph-reactor".into())
            .spawn(move || reactor.run())
            .map_err(|e| IlError::InsufficientResources(format!("spawning reactor: {e}")))?;

        Ok((ReactorHandle { ops: tx, waker }, thread))
    }

    fn run(&mut self) {
        let mut events = Events::with_capacity(64);

        loop {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("reactor poll failed: {err}");
                return;
            }

            for event in events.iter() {
                if event.token() == WAKER {
                    continue;
                }

                if let Some((_, component, port)) = self.entries.get(&event.token()) {
                    if event.is_writable() {
                        log::trace!("fd writable, nudging {:?}:{port}", component);
                        component.nudge(*port);
                    }
                }
            }

            if !self.drain_ops() {
                return;
            }
        }
    }

    /// Applies registry changes. Returns false on shutdown.
    fn drain_ops(&mut self) -> bool {
        loop {
            match self.ops.try_recv() {
                Ok(ReactorOp::Register {
                    fd,
                    component,
                    port,
                }) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if let Err(err) = self.poll.registry().register(
                        &mut SourceFd(&fd),
                        token,
                        Interest::WRITABLE,
                    ) {
                        log::warn!("registering fd {fd} failed: {err}");
                        continue;
                    }

                    self.entries.insert(token, (fd, component, port));
                }
                Ok(ReactorOp::Deregister { fd }) => {
                    self.entries.retain(|_, (entry_fd, _, _)| {
                        if *entry_fd == fd {
                            let _ = self.poll.registry().deregister(&mut SourceFd(entry_fd));
                            false
                        } else {
                            true
                        }
                    });
                }
                Ok(ReactorOp::Shutdown) => return false,
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::mpsc;

    use crate::il::{ComponentDef, ComponentEvent, ComponentId, PortConfig, ProcessorOps};

    struct Inert;
    impl ProcessorOps for Inert {}

    #[test]
    fn writable_pipe_nudges_the_component() {
        let (ev_tx, _ev_rx) = mpsc::channel::<ComponentEvent>();
        let comp = ComponentHandle::spawn(
            ComponentDef {
                name: "test.sink".into(),
                role: "audio_renderer.test".into(),
                ports: vec![PortConfig::audio_input(1, 4)],
            },
            ComponentId(0),
            Arc::new(ev_tx),
            Box::new(Inert),
        )
        .unwrap();

        let (reactor, thread) = Reactor::spawn().unwrap();

        // A fresh pipe's write end is immediately writable.
        let (mut reader, writer) = std::io::pipe().unwrap();
        let fd = {
            use std::os::fd::AsRawFd;
            writer.as_raw_fd()
        };

        reactor
            .register_writable(fd, comp.clone(), PortIndex(0))
            .unwrap();

        // The nudge is observable only as servant activity; absence of a
        // panic or hang is the assertion here. Give the edge a moment to
        // propagate, then shut down cleanly.
        std::thread::sleep(std::time::Duration::from_millis(50));

        reactor.deregister(fd).unwrap();
        reactor.shutdown();
        thread.join().unwrap();

        comp.shutdown();
        drop(writer);
        let mut buf = [0u8; 1];
        let _ = reader.read(&mut buf);
    }
}
