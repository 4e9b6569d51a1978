//! Background builds.
//!
//! One build runs at a time per service, on its own worker thread. Progress, log lines,
//! geometry prompts and the final result travel back over an `mpsc` channel so the
//! caller's thread never blocks on a subprocess.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::build::pipeline::{BuildOutcome, BuildRequest, GeometryPrompt, Pipeline, ProgressSink, Stage};
use crate::error::{BuildError, BuildFailure, BuildResult};

/// Answer channel handed out with [`BuildEvent::GeometryRequested`].
pub struct GeometryReply(SyncSender<Option<PathBuf>>);

impl GeometryReply {
    /// Send the chosen file, or `None` to continue without replacement.
    ///
    /// Answers that arrive after the worker stopped waiting are dropped.
    pub fn send(self, geometry: Option<PathBuf>) {
        if self.0.send(geometry).is_err() {
            debug!("geometry answer arrived after the build stopped waiting");
        }
    }
}

impl fmt::Debug for GeometryReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GeometryReply")
    }
}

#[derive(Debug)]
pub enum BuildEvent {
    Stage { stage: Stage, percent: u8 },
    Log(String),
    /// The worker is blocked until `reply` is answered or the prompt timeout passes.
    GeometryRequested { weapon_key: String, reply: GeometryReply },
    /// Not sent for cancelled builds.
    Finished(Result<BuildOutcome, BuildFailure>),
}

/// Forwards pipeline callbacks as events.
struct ChannelSink {
    events: Sender<BuildEvent>,
    prompt_timeout: Duration,
}

impl ChannelSink {
    fn send(&self, event: BuildEvent) {
        if self.events.send(event).is_err() {
            debug!("build event receiver dropped");
        }
    }
}

impl ProgressSink for ChannelSink {
    fn stage(&self, stage: Stage) {
        self.send(BuildEvent::Stage {
            stage,
            percent: stage.percent(),
        });
    }

    fn log(&self, message: &str) {
        self.send(BuildEvent::Log(message.to_string()));
    }
}

impl GeometryPrompt for ChannelSink {
    fn request_geometry(&self, weapon_key: &str) -> Option<PathBuf> {
        let (reply, answer) = mpsc::sync_channel(1);
        let request = BuildEvent::GeometryRequested {
            weapon_key: weapon_key.to_string(),
            reply: GeometryReply(reply),
        };
        if self.events.send(request).is_err() {
            return None;
        }
        match answer.recv_timeout(self.prompt_timeout) {
            Ok(geometry) => geometry,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "no geometry selected within {}s, continuing without replacement",
                    self.prompt_timeout.as_secs()
                );
                None
            }
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// Clears the in-flight flag even if the worker panics.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A running build.
#[derive(Debug)]
pub struct BuildHandle {
    thread: JoinHandle<()>,
    cancel: Arc<AtomicBool>,
}

impl BuildHandle {
    /// Stop at the next stage boundary. A running tool is allowed to finish.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the worker. Returns false if it panicked.
    pub fn join(self) -> bool {
        self.thread.join().is_ok()
    }
}

/// Admits one build at a time and runs it off the calling thread.
#[derive(Debug)]
pub struct BuildService {
    pipeline: Pipeline,
    in_flight: Arc<AtomicBool>,
}

impl BuildService {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Start a build. A second request while one is running is rejected, not queued.
    pub fn start(&self, request: BuildRequest, events: Sender<BuildEvent>) -> BuildResult<BuildHandle> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BuildError::BuildInProgress);
        }
        let guard = InFlight(Arc::clone(&self.in_flight));

        // Each build owns its cancel flag.
        let cancel = Arc::new(AtomicBool::new(false));
        let pipeline = self.pipeline.clone().with_cancel_token(Arc::clone(&cancel));

        let sink = ChannelSink {
            events,
            prompt_timeout: pipeline.settings().geometry_prompt_timeout(),
        };
        let thread = thread::Builder::new()
            .name(format!("build-{}", request.target))
            .spawn(move || {
                let result = pipeline.run(&request, &sink, Some(&sink as &dyn GeometryPrompt));
                // Release admission before announcing the result so a listener can start
                // the next build straight away.
                drop(guard);
                match result {
                    Err(BuildFailure {
                        error: BuildError::Cancelled,
                        ..
                    }) => debug!("build for {} cancelled, no result sent", request.target),
                    result => sink.send(BuildEvent::Finished(result)),
                }
            })
            .map_err(|err| BuildError::Spawn {
                program: "build worker".to_string(),
                err,
            })?;

        Ok(BuildHandle { thread, cancel })
    }
}
