// SPDX-License-Identifier: GPL-3.0-only

//! Media pipeline engines
//!
//! The session controller only produces source descriptors. An engine turns
//! a descriptor into a running pipeline, reports whether it started, and
//! forwards later failures or end-of-stream over an event channel.

use crate::constants::timing;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Lifecycle notification from a running pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// The pipeline failed after it was confirmed
    Error(String),
    /// The source stopped producing data
    EndOfStream,
}

pub type PipelineEventSender = mpsc::UnboundedSender<PipelineEvent>;

/// Something that can run a source descriptor
pub trait PipelineEngine: Send + Sync {
    /// Build and start a pipeline for `descriptor`
    ///
    /// Blocks until the pipeline is confirmed playing or has failed. Any
    /// previously started pipeline must be stopped first.
    ///
    /// # Returns
    /// * `Ok(())` - The pipeline is playing
    /// * `Err(message)` - Construction or start-up failed
    fn start(&self, descriptor: &str) -> Result<(), String>;

    /// Tear the pipeline down; no-op when nothing runs
    fn stop(&self);

    fn is_running(&self) -> bool;
}

/// Split a descriptor into `gst-launch-1.0` arguments, keeping quoted values whole
pub fn split_descriptor(descriptor: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in descriptor.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                current.push(c);
                in_quotes = !in_quotes;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }

    // Don't forget the last argument
    if !current.is_empty() {
        args.push(current);
    }
    args
}

/// Last non-empty line of a tool's diagnostic output
fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rev().find(|l| !l.is_empty())
}

struct RunningChild {
    child: Child,
    generation: u64,
}

/// Runs descriptors through `gst-launch-1.0` child processes
///
/// A child still alive at the end of the confirmation window counts as
/// playing. A watcher thread reports its later exit as an event.
pub struct GstLaunchEngine {
    program: String,
    sink: String,
    confirm_window: Duration,
    events: Option<PipelineEventSender>,
    running: Arc<Mutex<Option<RunningChild>>>,
    generation: AtomicU64,
}

impl Default for GstLaunchEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl GstLaunchEngine {
    pub fn new() -> Self {
        Self {
            program: "gst-launch-1.0".to_string(),
            sink: "autovideosink".to_string(),
            confirm_window: timing::PIPELINE_CONFIRM,
            events: None,
            running: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    /// Forward lifecycle events to `events`
    pub fn with_events(mut self, events: PipelineEventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Terminal element appended to every descriptor (e.g. `fakesink` for headless runs)
    pub fn with_sink(mut self, sink: impl Into<String>) -> Self {
        self.sink = sink.into();
        self
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_confirm_window(mut self, window: Duration) -> Self {
        self.confirm_window = window;
        self
    }

    /// Command line arguments for a descriptor
    pub fn arguments(&self, descriptor: &str) -> Vec<String> {
        let mut args = vec!["-q".to_string(), "-e".to_string()];
        args.extend(split_descriptor(descriptor));
        args.push("!".to_string());
        args.push(self.sink.clone());
        args
    }

    fn read_stderr(child: &mut Child) -> String {
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        stderr
    }

    fn exit_message(status: std::process::ExitStatus, stderr: &str) -> String {
        let reason = last_line(stderr).unwrap_or("no diagnostic output");
        match status.code() {
            Some(code) => format!("pipeline exited with code {}: {}", code, reason),
            None => format!("pipeline was terminated: {}", reason),
        }
    }

    /// Report the child's exit unless it was stopped or replaced meanwhile
    fn watch(
        running: Arc<Mutex<Option<RunningChild>>>,
        generation: u64,
        events: Option<PipelineEventSender>,
    ) {
        std::thread::spawn(move || {
            loop {
                std::thread::sleep(Duration::from_millis(100));
                let event = {
                    let mut slot = running.lock().unwrap_or_else(|e| e.into_inner());
                    let Some(current) = slot.as_mut() else {
                        return;
                    };
                    if current.generation != generation {
                        return;
                    }
                    match current.child.try_wait() {
                        Ok(None) => continue,
                        Ok(Some(status)) => {
                            let stderr = Self::read_stderr(&mut current.child);
                            *slot = None;
                            if status.success() {
                                PipelineEvent::EndOfStream
                            } else {
                                PipelineEvent::Error(Self::exit_message(status, &stderr))
                            }
                        }
                        Err(e) => {
                            *slot = None;
                            PipelineEvent::Error(e.to_string())
                        }
                    }
                };

                info!(?event, "Pipeline process finished");
                if let Some(events) = &events {
                    let _ = events.send(event);
                }
                return;
            }
        });
    }
}

impl PipelineEngine for GstLaunchEngine {
    fn start(&self, descriptor: &str) -> Result<(), String> {
        self.stop();

        let args = self.arguments(descriptor);
        debug!(program = %self.program, ?args, "Launching pipeline");
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("failed to launch {}: {}", self.program, e))?;

        let deadline = Instant::now() + self.confirm_window;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let stderr = Self::read_stderr(&mut child);
                    let message = Self::exit_message(status, &stderr);
                    warn!(%message, "Pipeline failed during start-up");
                    return Err(message);
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                Err(e) => return Err(e.to_string()),
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.running.lock().unwrap_or_else(|e| e.into_inner()) = Some(RunningChild { child, generation });
        Self::watch(Arc::clone(&self.running), generation, self.events.clone());
        info!("Pipeline confirmed playing");
        Ok(())
    }

    fn stop(&self) {
        let Some(mut running) = self.running.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };

        // SIGINT lets gst-launch (-e) push EOS and shut down cleanly
        if let Ok(pid) = libc::pid_t::try_from(running.child.id()) {
            unsafe {
                libc::kill(pid, libc::SIGINT);
            }
        }
        let deadline = Instant::now() + Duration::from_millis(500);
        while Instant::now() < deadline {
            if let Ok(Some(_)) = running.child.try_wait() {
                debug!("Pipeline process exited");
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        if let Err(e) = running.child.kill() {
            error!(error = %e, "Failed to kill pipeline process");
        }
        let _ = running.child.wait();
        debug!("Pipeline process killed");
    }

    fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

#[cfg(feature = "gstreamer")]
pub use gst::GstEngine;

#[cfg(feature = "gstreamer")]
mod gst {
    use super::{PipelineEngine, PipelineEvent, PipelineEventSender};
    use crate::constants::timing;
    use gstreamer::prelude::*;
    use std::sync::Mutex;
    use tracing::{debug, error, info, warn};

    /// In-process engine built with `gstreamer::parse::launch`
    pub struct GstEngine {
        sink: String,
        events: Option<PipelineEventSender>,
        pipeline: Mutex<Option<gstreamer::Pipeline>>,
    }

    impl GstEngine {
        pub fn new() -> Result<Self, String> {
            gstreamer::init().map_err(|e| e.to_string())?;
            Ok(Self {
                sink: "autovideosink".to_string(),
                events: None,
                pipeline: Mutex::new(None),
            })
        }

        pub fn with_events(mut self, events: PipelineEventSender) -> Self {
            self.events = Some(events);
            self
        }

        pub fn with_sink(mut self, sink: impl Into<String>) -> Self {
            self.sink = sink.into();
            self
        }

        /// Forward bus errors and EOS until the bus is flushed on stop
        fn watch_bus(&self, pipeline: &gstreamer::Pipeline) {
            let Some(bus) = pipeline.bus() else {
                warn!("Pipeline has no bus, lifecycle events are not forwarded");
                return;
            };
            let events = self.events.clone();
            std::thread::spawn(move || {
                for msg in bus.iter_timed(gstreamer::ClockTime::NONE) {
                    use gstreamer::MessageView;
                    let event = match msg.view() {
                        MessageView::Error(err) => {
                            error!(
                                error = %err.error(),
                                debug = ?err.debug(),
                                source = ?err.src().map(|s| s.name()),
                                "GStreamer error"
                            );
                            PipelineEvent::Error(err.error().to_string())
                        }
                        MessageView::Eos(_) => PipelineEvent::EndOfStream,
                        _ => continue,
                    };
                    if let Some(events) = &events {
                        let _ = events.send(event);
                    }
                    break;
                }
                debug!("Bus watch finished");
            });
        }
    }

    impl PipelineEngine for GstEngine {
        fn start(&self, descriptor: &str) -> Result<(), String> {
            self.stop();

            let launch = format!("{} ! {}", descriptor, self.sink);
            let pipeline = gstreamer::parse::launch(&launch)
                .map_err(|e| e.to_string())?
                .downcast::<gstreamer::Pipeline>()
                .map_err(|_| "descriptor did not produce a pipeline".to_string())?;

            let fail = |message: String| {
                let _ = pipeline.set_state(gstreamer::State::Null);
                Err(message)
            };

            if let Err(e) = pipeline.set_state(gstreamer::State::Playing) {
                return fail(format!("failed to start pipeline: {}", e));
            }
            let timeout = timing::PIPELINE_STATE_TIMEOUT.as_millis() as u64;
            let (result, state, pending) =
                pipeline.state(gstreamer::ClockTime::from_mseconds(timeout));
            debug!(result = ?result, state = ?state, pending = ?pending, "Pipeline state");

            if let Some(bus) = pipeline.bus()
                && let Some(msg) = bus.pop_filtered(&[gstreamer::MessageType::Error])
                && let gstreamer::MessageView::Error(err) = msg.view()
            {
                return fail(err.error().to_string());
            }
            if result.is_err() {
                return fail(format!("pipeline did not reach PLAYING (state {:?})", state));
            }

            self.watch_bus(&pipeline);
            *self.pipeline.lock().unwrap_or_else(|e| e.into_inner()) = Some(pipeline);
            info!("Pipeline confirmed playing");
            Ok(())
        }

        fn stop(&self) {
            let Some(pipeline) = self.pipeline.lock().unwrap_or_else(|e| e.into_inner()).take() else {
                return;
            };
            if let Some(bus) = pipeline.bus() {
                bus.set_flushing(true);
            }
            if let Err(e) = pipeline.set_state(gstreamer::State::Null) {
                warn!(error = %e, "Failed to stop pipeline");
            }
            debug!("Pipeline stopped");
        }

        fn is_running(&self) -> bool {
            self.pipeline
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_some()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_descriptor_keeps_quoted_values() {
        let args = split_descriptor(
            "udpsrc port=5000 caps=\"video/mpegts,packetsize=(int)1316\" ! souphttpsrc location=\"http://a/b c\\\"d\"",
        );
        assert_eq!(
            args,
            vec![
                "udpsrc",
                "port=5000",
                "caps=\"video/mpegts,packetsize=(int)1316\"",
                "!",
                "souphttpsrc",
                "location=\"http://a/b c\\\"d\"",
            ]
        );
    }

    #[test]
    fn test_arguments_append_sink() {
        let engine = GstLaunchEngine::new().with_sink("fakesink");
        assert_eq!(
            engine.arguments("v4l2src device=/dev/video0 ! videoconvert"),
            vec!["-q", "-e", "v4l2src", "device=/dev/video0", "!", "videoconvert", "!", "fakesink"]
        );
    }

    #[test]
    fn test_missing_program_fails_to_start() {
        let engine = GstLaunchEngine::new().with_program("camhub-no-such-gst-launch");
        assert!(engine.start("videotestsrc").is_err());
        assert!(!engine.is_running());
        engine.stop();
    }

    #[test]
    fn test_early_exit_is_a_start_failure() {
        let engine = GstLaunchEngine::new()
            .with_program("false")
            .with_confirm_window(Duration::from_secs(2));
        let err = engine.start("videotestsrc").unwrap_err();
        assert!(err.contains("exited with code 1"), "{}", err);
    }
}
