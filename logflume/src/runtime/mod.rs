//! The plugin-process runtime.
//!
//! One [`PluginRuntime`] sits at the top of every plugin process. It owns the
//! pipe to the parent, a table of [`ExecUnit`]s keyed by unit id, and the
//! process-global concerns: stdout capture and the ignored interrupt signal.
//!
//! # Architecture
//!
//! ```text
//! parent ──frames──► Pipe ──► PluginRuntime ──► ExecUnit mailbox ──► plugin
//!                                  │
//!                                  ├── InfoRequest → InfoResponse
//!                                  └── Stop → fan out, join all, Terminated
//! ```
//!
//! Inbound messages for an unknown unit id create the unit on demand through
//! the factory. A `Stop` from the parent fans out to every unit, waits for
//! each to drain its mailbox and close its plugin, and only then replies
//! `Terminated` — the parent can rely on that ordering. Pipe EOF exits the
//! loop without any reply; orphaned units die with the process.

mod stdout;
pub mod unit;

pub use stdout::{ignore_interrupt, redirect_stdout, spawn_stdout_capture, StdoutRedirect};
pub use unit::{ExecUnit, MAILBOX_CAPACITY};

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;

use thiserror::Error;

use crate::message::{Body, Message, PluginInfo};
use crate::pipe::Pipe;
use crate::plugin::{PluginFactory, PluginInstance};

/// Runtime startup errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Standard output could not be redirected; the process must not run
    /// user code with a corruptible framed channel.
    #[error("failed to redirect stdout: {0}")]
    StdoutRedirect(#[from] io::Error),
}

/// Process-wide plugin runtime state.
pub struct PluginRuntime {
    name: String,
    factory: PluginFactory,
    units: HashMap<i32, ExecUnit>,
}

impl PluginRuntime {
    /// Create a runtime for the named plugin.
    ///
    /// The factory is invoked once per unit, on the first message addressed
    /// to a new unit id.
    pub fn new(
        name: impl Into<String>,
        factory: impl Fn() -> PluginInstance + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            factory: std::sync::Arc::new(factory),
            units: HashMap::new(),
        }
    }

    /// Run as an out-of-process plugin: frames on stdin/stdout, diagnostics
    /// on stderr, SIGINT ignored.
    ///
    /// Returns once the parent sends `Stop` (after `Terminated` is queued) or
    /// the pipe reaches EOF. Fails only when stdout redirection cannot be
    /// established, in which case the caller should exit non-zero.
    pub async fn run(self) -> Result<(), RuntimeError> {
        ignore_interrupt();
        let redirect = redirect_stdout()?;
        let pipe = Pipe::process(redirect.pipe_out);
        let _capture = spawn_stdout_capture(redirect.capture, pipe.writer());
        self.event_loop(pipe).await;
        Ok(())
    }

    /// Run over an explicit pipe, for embedded plugins and tests.
    pub async fn run_with_pipe(self, pipe: Pipe) {
        self.event_loop(pipe).await;
    }

    async fn event_loop(mut self, pipe: Pipe) {
        let (mut reader, writer) = pipe.split();
        tracing::info!(plugin = %self.name, "plugin runtime started");

        loop {
            let msg = match reader.read().await {
                Ok(msg) => msg,
                Err(_) => {
                    // EOF or transport failure: exit without acknowledgement.
                    tracing::info!(plugin = %self.name, "pipe closed, runtime exiting");
                    return;
                }
            };

            match msg.body {
                Body::InfoRequest => {
                    let reply = Message::control(Body::InfoResponse(PluginInfo::default()));
                    if writer.write(reply).is_err() {
                        return;
                    }
                }
                Body::Stop => {
                    self.stop_units().await;
                    let _ = writer.write(Message::control(Body::Terminated));
                    tracing::info!(plugin = %self.name, "plugin runtime terminated");
                    return;
                }
                _ => {
                    let unit = match self.units.entry(msg.unit_id) {
                        Entry::Occupied(entry) => entry.into_mut(),
                        Entry::Vacant(entry) => {
                            tracing::debug!(
                                plugin = %self.name,
                                unit_id = msg.unit_id,
                                "creating exec unit"
                            );
                            entry.insert(ExecUnit::spawn(
                                msg.unit_id,
                                &self.name,
                                (self.factory)(),
                                writer.clone(),
                            ))
                        }
                    };
                    unit.deliver(msg).await;
                }
            }
        }
    }

    /// Fan `Stop` out to every unit and wait for all of them to finish.
    async fn stop_units(&mut self) {
        let units: Vec<ExecUnit> = self.units.drain().map(|(_, unit)| unit).collect();
        futures::future::join_all(units.into_iter().map(ExecUnit::stop)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Event, Record};
    use crate::plugin::{Env, Plugin, PluginError};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    struct NoopPlugin {
        closed: Arc<AtomicBool>,
    }

    impl Plugin for NoopPlugin {
        fn init(&mut self, _env: Env) -> Result<(), PluginError> {
            Ok(())
        }
        fn start(&mut self) -> Result<(), PluginError> {
            Ok(())
        }
        fn close(&mut self) -> Result<(), PluginError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn noop_runtime(closed: Arc<AtomicBool>, created: Arc<AtomicUsize>) -> PluginRuntime {
        PluginRuntime::new("test", move || {
            created.fetch_add(1, Ordering::SeqCst);
            PluginInstance::Input(Box::new(NoopPlugin {
                closed: closed.clone(),
            }))
        })
    }

    #[tokio::test]
    async fn test_info_request_gets_protocol_version() {
        let (mut host, plugin_pipe) = Pipe::in_process();
        let runtime = noop_runtime(Arc::default(), Arc::default());
        let handle = tokio::spawn(runtime.run_with_pipe(plugin_pipe));

        host.write(Message::control(Body::InfoRequest)).unwrap();
        let reply = host.read().await.unwrap();
        let Body::InfoResponse(info) = reply.body else {
            panic!("expected info response");
        };
        assert_eq!(info.proto_ver, 1);

        host.write(Message::control(Body::Stop)).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_units_are_created_on_first_message() {
        let created = Arc::new(AtomicUsize::new(0));
        let (mut host, plugin_pipe) = Pipe::in_process();
        let runtime = noop_runtime(Arc::default(), created.clone());
        let handle = tokio::spawn(runtime.run_with_pipe(plugin_pipe));

        host.write(Message::unit(1, Body::Configure(String::new())))
            .unwrap();
        host.write(Message::unit(1, Body::Start)).unwrap();
        host.write(Message::unit(2, Body::Configure(String::new())))
            .unwrap();
        host.write(Message::control(Body::Stop)).unwrap();

        let reply = host.read().await.unwrap();
        assert_eq!(reply.body, Body::Terminated);
        assert_eq!(created.load(Ordering::SeqCst), 2);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_terminated_only_after_units_closed() {
        let closed = Arc::new(AtomicBool::new(false));
        let (mut host, plugin_pipe) = Pipe::in_process();
        let runtime = noop_runtime(closed.clone(), Arc::default());
        let handle = tokio::spawn(runtime.run_with_pipe(plugin_pipe));

        host.write(Message::unit(1, Body::Configure(String::new())))
            .unwrap();
        host.write(Message::unit(
            1,
            Body::Event(Event::new("t", Record::new())),
        ))
        .unwrap();
        host.write(Message::control(Body::Stop)).unwrap();

        let reply = host.read().await.unwrap();
        assert_eq!(reply.body, Body::Terminated);
        // By the time Terminated is observable, every close has returned.
        assert!(closed.load(Ordering::SeqCst));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_pipe_eof_exits_without_reply() {
        let (host, plugin_pipe) = Pipe::in_process();
        let runtime = noop_runtime(Arc::default(), Arc::default());
        let handle = tokio::spawn(runtime.run_with_pipe(plugin_pipe));

        drop(host);
        // The loop must exit on its own, with no Terminated sent anywhere.
        handle.await.unwrap();
    }
}
