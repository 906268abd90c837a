//! Per-unit execution shell.
//!
//! An [`ExecUnit`] owns one plugin instance and a bounded mailbox, and runs
//! a dedicated task that consumes mailbox messages one at a time, in pipe
//! arrival order. The runtime is the only producer; the worker task is the
//! only consumer. Producers block when the mailbox is full.
//!
//! Lifecycle: the unit is created on the first message addressed to its id
//! and torn down by `Stop`, which flushes and closes the output buffer (if
//! any), calls the plugin's `close`, and ends the worker task. Configuration
//! or start failures park the unit: the worker exits, later messages are
//! dropped, and other units are unaffected.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Interval;

use crate::buffer::MemoryBuffer;
use crate::message::{Body, Message};
use crate::pipe::PipeWriter;
use crate::plugin::{OutputPlugin, PluginInstance, UnitLogger};

/// Mailbox capacity per unit.
pub const MAILBOX_CAPACITY: usize = 100;

/// Whether the worker keeps consuming after a message.
enum Flow {
    Continue,
    Done,
}

/// Handle to one running unit, owned by the runtime.
pub struct ExecUnit {
    id: i32,
    tx: mpsc::Sender<Message>,
    handle: JoinHandle<()>,
}

impl ExecUnit {
    /// Create the unit and spawn its worker task.
    pub fn spawn(id: i32, plugin_name: &str, instance: PluginInstance, writer: PipeWriter) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let logger = UnitLogger::new(id, plugin_name);
        let worker = UnitWorker {
            id,
            instance,
            writer,
            logger,
            buffer: None,
        };
        let handle = tokio::spawn(worker.run(rx));
        Self { id, tx, handle }
    }

    /// Enqueue a message, blocking while the mailbox is full.
    ///
    /// Messages for a unit that already shut down are dropped; the parent
    /// observes the death only as silence from this unit.
    pub async fn deliver(&self, msg: Message) {
        let _ = self.tx.send(msg).await;
    }

    /// Deliver `Stop`, close the mailbox, and wait for the worker to finish.
    pub async fn stop(self) {
        let _ = self.tx.send(Message::unit(self.id, Body::Stop)).await;
        drop(self.tx);
        let _ = self.handle.await;
    }
}

/// The state that lives inside the worker task.
struct UnitWorker {
    id: i32,
    instance: PluginInstance,
    writer: PipeWriter,
    logger: UnitLogger,
    buffer: Option<MemoryBuffer>,
}

impl UnitWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<Message>) {
        self.logger.info("plugin started");
        let mut flush: Option<Interval> = None;

        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(msg) = maybe else { break };
                    match self.handle(msg, &mut flush) {
                        Flow::Continue => {}
                        Flow::Done => break,
                    }
                }
                _ = tick(&mut flush), if flush.is_some() => {
                    self.flush_pending();
                }
            }
        }
        self.logger.info("plugin stopped");
    }

    fn handle(&mut self, msg: Message, flush: &mut Option<Interval>) -> Flow {
        match msg.body {
            Body::BufferOption(opts) => {
                if self.instance.is_output() {
                    let buffer = MemoryBuffer::new(opts);
                    *flush = Some(tokio::time::interval(buffer.flush_interval()));
                    self.buffer = Some(buffer);
                }
                Flow::Continue
            }
            Body::Configure(blob) => {
                let env = crate::plugin::Env::new(
                    self.id,
                    blob,
                    self.writer.clone(),
                    self.logger.clone(),
                );
                if let Err(e) = self.instance.as_plugin_mut().init(env) {
                    self.logger.error(format_args!("Failed to configure: {e}"));
                    return Flow::Done;
                }
                Flow::Continue
            }
            Body::Start => {
                if let Err(e) = self.instance.as_plugin_mut().start() {
                    self.logger.error(format_args!("Failed to start: {e}"));
                    return Flow::Done;
                }
                Flow::Continue
            }
            Body::Event(event) => {
                self.handle_event(event);
                Flow::Continue
            }
            Body::Stop => {
                self.shutdown();
                Flow::Done
            }
            // Remaining message types are parent-bound or runtime-wide and
            // never reach a unit mailbox.
            other => {
                self.logger.debug(format_args!(
                    "ignoring unexpected message type {}",
                    other.kind()
                ));
                Flow::Continue
            }
        }
    }

    fn handle_event(&mut self, event: crate::message::Event) {
        match &mut self.instance {
            PluginInstance::Filter(fp) => {
                let forwarded = match fp.filter(&event) {
                    Ok(out) => out,
                    Err(e) => {
                        self.logger.warn(format_args!("Filter error: {e}"));
                        Some(event)
                    }
                };
                if let Some(out) = forwarded {
                    if self
                        .writer
                        .write(Message::unit(self.id, Body::EventChain(out)))
                        .is_err()
                    {
                        self.logger.debug("event chain dropped, pipe closed");
                    }
                }
            }
            PluginInstance::Output(op) => {
                let item = match op.encode(&event) {
                    Ok(Some(item)) => item,
                    Ok(None) => return,
                    Err(e) => {
                        self.logger.warn(format_args!("Encode error: {e}"));
                        return;
                    }
                };
                let Some(buffer) = self.buffer.as_mut() else {
                    self.logger.warn("event dropped: no buffer configured");
                    return;
                };
                match buffer.push(item) {
                    Ok(Some(chunk)) => write_chunk(op, &self.logger, chunk),
                    Ok(None) => {}
                    Err(e) => self.logger.warn(format_args!("Buffering error: {e}")),
                }
            }
            PluginInstance::Input(_) => {}
        }
    }

    fn flush_pending(&mut self) {
        let Some(chunk) = self.buffer.as_mut().and_then(MemoryBuffer::take_chunk) else {
            return;
        };
        if let PluginInstance::Output(op) = &mut self.instance {
            write_chunk(op, &self.logger, chunk);
        }
    }

    fn shutdown(&mut self) {
        if let PluginInstance::Output(op) = &mut self.instance {
            if let Some(chunk) = self.buffer.take().and_then(|mut b| b.take_chunk()) {
                write_chunk(op, &self.logger, chunk);
            }
        }
        if let Err(e) = self.instance.as_plugin_mut().close() {
            self.logger.warn(format_args!("Close error: {e}"));
        }
    }
}

fn write_chunk(
    op: &mut Box<dyn OutputPlugin>,
    logger: &UnitLogger,
    chunk: Vec<Box<dyn crate::buffer::Sizer>>,
) {
    let len = chunk.len();
    if let Err(e) = op.write(chunk) {
        logger.warn(format_args!("Write error, {len} items dropped: {e}"));
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        // Guarded out by the select precondition.
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BytesItem, Sizer};
    use crate::message::{BufferOptions, Event, Record};
    use crate::pipe::Pipe;
    use crate::plugin::{Env, FilterPlugin, Plugin, PluginError};
    use std::sync::{Arc, Mutex};

    /// Shared call log so tests can assert ordering across the task boundary.
    type Calls = Arc<Mutex<Vec<String>>>;

    struct RecordingOutput {
        calls: Calls,
        fail_encode: bool,
    }

    impl Plugin for RecordingOutput {
        fn init(&mut self, _env: Env) -> Result<(), PluginError> {
            self.calls.lock().unwrap().push("init".into());
            Ok(())
        }
        fn start(&mut self) -> Result<(), PluginError> {
            self.calls.lock().unwrap().push("start".into());
            Ok(())
        }
        fn close(&mut self) -> Result<(), PluginError> {
            self.calls.lock().unwrap().push("close".into());
            Ok(())
        }
    }

    impl crate::plugin::OutputPlugin for RecordingOutput {
        fn encode(&mut self, event: &Event) -> Result<Option<Box<dyn Sizer>>, PluginError> {
            if self.fail_encode {
                return Err(PluginError::other("encode refused"));
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("encode:{}", event.tag));
            Ok(Some(Box::new(BytesItem(event.tag.clone().into_bytes()))))
        }
        fn write(&mut self, chunk: Vec<Box<dyn Sizer>>) -> Result<usize, PluginError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("write:{}", chunk.len()));
            Ok(chunk.len())
        }
    }

    struct UppercaseFilter {
        fail: bool,
    }

    impl Plugin for UppercaseFilter {
        fn init(&mut self, _env: Env) -> Result<(), PluginError> {
            Ok(())
        }
        fn start(&mut self) -> Result<(), PluginError> {
            Ok(())
        }
        fn close(&mut self) -> Result<(), PluginError> {
            Ok(())
        }
    }

    impl FilterPlugin for UppercaseFilter {
        fn filter(&mut self, event: &Event) -> Result<Option<Event>, PluginError> {
            if self.fail {
                return Err(PluginError::other("filter refused"));
            }
            Ok(Some(Event::with_time(
                event.tag.to_uppercase(),
                event.time,
                event.record.clone(),
            )))
        }
    }

    struct FailingInit;

    impl Plugin for FailingInit {
        fn init(&mut self, _env: Env) -> Result<(), PluginError> {
            Err(PluginError::other("bad config"))
        }
        fn start(&mut self) -> Result<(), PluginError> {
            panic!("start must not be reached after a failed init");
        }
        fn close(&mut self) -> Result<(), PluginError> {
            Ok(())
        }
    }

    fn event(tag: &str) -> Event {
        Event::new(tag, Record::new())
    }

    #[tokio::test]
    async fn test_output_unit_processes_in_mailbox_order() {
        let calls: Calls = Arc::default();
        let (_host, plugin_pipe) = Pipe::in_process();
        let unit = ExecUnit::spawn(
            1,
            "test-out",
            PluginInstance::Output(Box::new(RecordingOutput {
                calls: calls.clone(),
                fail_encode: false,
            })),
            plugin_pipe.writer(),
        );

        unit.deliver(Message::unit(
            1,
            Body::BufferOption(BufferOptions {
                flush_interval_secs: 60,
                ..Default::default()
            }),
        ))
        .await;
        unit.deliver(Message::unit(1, Body::Configure(String::new())))
            .await;
        unit.deliver(Message::unit(1, Body::Start)).await;
        for tag in ["a", "b", "c"] {
            unit.deliver(Message::unit(1, Body::Event(event(tag)))).await;
        }
        unit.stop().await;

        let calls = calls.lock().unwrap();
        assert_eq!(
            calls.as_slice(),
            [
                "init", "start", "encode:a", "encode:b", "encode:c", "write:3", "close"
            ]
        );
    }

    #[tokio::test]
    async fn test_filter_unit_emits_event_chain() {
        let (mut host, plugin_pipe) = Pipe::in_process();
        let unit = ExecUnit::spawn(
            2,
            "test-filter",
            PluginInstance::Filter(Box::new(UppercaseFilter { fail: false })),
            plugin_pipe.writer(),
        );

        unit.deliver(Message::unit(2, Body::Configure(String::new())))
            .await;
        unit.deliver(Message::unit(2, Body::Start)).await;
        unit.deliver(Message::unit(2, Body::Event(event("foo")))).await;

        let msg = host.read().await.unwrap();
        assert_eq!(msg.unit_id, 2);
        let Body::EventChain(out) = msg.body else {
            panic!("expected event chain");
        };
        assert_eq!(out.tag, "FOO");

        unit.stop().await;
    }

    #[tokio::test]
    async fn test_filter_error_passes_original_through() {
        let (mut host, plugin_pipe) = Pipe::in_process();
        let unit = ExecUnit::spawn(
            3,
            "test-filter",
            PluginInstance::Filter(Box::new(UppercaseFilter { fail: true })),
            plugin_pipe.writer(),
        );

        let original = event("keep.me");
        unit.deliver(Message::unit(3, Body::Configure(String::new())))
            .await;
        unit.deliver(Message::unit(3, Body::Start)).await;
        unit.deliver(Message::unit(3, Body::Event(original.clone())))
            .await;

        let msg = host.read().await.unwrap();
        let Body::EventChain(out) = msg.body else {
            panic!("expected event chain");
        };
        assert_eq!(out, original);

        unit.stop().await;
    }

    #[tokio::test]
    async fn test_encode_error_drops_event_and_continues() {
        let calls: Calls = Arc::default();
        let (_host, plugin_pipe) = Pipe::in_process();
        let unit = ExecUnit::spawn(
            4,
            "test-out",
            PluginInstance::Output(Box::new(RecordingOutput {
                calls: calls.clone(),
                fail_encode: true,
            })),
            plugin_pipe.writer(),
        );

        unit.deliver(Message::unit(4, Body::BufferOption(BufferOptions::default())))
            .await;
        unit.deliver(Message::unit(4, Body::Configure(String::new())))
            .await;
        unit.deliver(Message::unit(4, Body::Start)).await;
        unit.deliver(Message::unit(4, Body::Event(event("dropped"))))
            .await;
        unit.stop().await;

        let calls = calls.lock().unwrap();
        // No encode or write entries: the event was dropped, the unit kept
        // running and closed cleanly.
        assert_eq!(calls.as_slice(), ["init", "start", "close"]);
    }

    #[tokio::test]
    async fn test_failed_init_parks_the_unit() {
        let (_host, plugin_pipe) = Pipe::in_process();
        let unit = ExecUnit::spawn(
            5,
            "test-bad",
            PluginInstance::Input(Box::new(FailingInit)),
            plugin_pipe.writer(),
        );

        unit.deliver(Message::unit(5, Body::Configure(String::new())))
            .await;
        // The worker has exited; Start is silently dropped instead of
        // reaching the plugin (which would panic).
        unit.deliver(Message::unit(5, Body::Start)).await;
        unit.stop().await;
    }

    #[tokio::test]
    async fn test_chunk_limit_triggers_mid_stream_write() {
        let calls: Calls = Arc::default();
        let (_host, plugin_pipe) = Pipe::in_process();
        let unit = ExecUnit::spawn(
            6,
            "test-out",
            PluginInstance::Output(Box::new(RecordingOutput {
                calls: calls.clone(),
                fail_encode: false,
            })),
            plugin_pipe.writer(),
        );

        unit.deliver(Message::unit(
            6,
            Body::BufferOption(BufferOptions {
                chunk_limit: 2,
                flush_interval_secs: 60,
                ..Default::default()
            }),
        ))
        .await;
        unit.deliver(Message::unit(6, Body::Configure(String::new())))
            .await;
        unit.deliver(Message::unit(6, Body::Start)).await;
        for tag in ["a", "b", "c"] {
            unit.deliver(Message::unit(6, Body::Event(event(tag)))).await;
        }
        unit.stop().await;

        let calls = calls.lock().unwrap();
        assert_eq!(
            calls.as_slice(),
            [
                "init", "start", "encode:a", "encode:b", "write:2", "encode:c", "write:1", "close"
            ]
        );
    }
}
