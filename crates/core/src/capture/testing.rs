use crate::capture::{
    ActiveRecognition, Camera, CameraStream, CaptureError, RecognitionEvent, SpeechRecognizer,
};
use crate::media::EncodedImage;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Camera double; `live` counts streams not yet released.
#[derive(Default)]
pub struct FakeCamera {
    pub deny: bool,
    pub broken: bool,
    pub opened: AtomicUsize,
    pub live: Arc<AtomicUsize>,
}

impl FakeCamera {
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

struct FakeStream {
    live: Arc<AtomicUsize>,
    shots: u8,
    broken: bool,
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CameraStream for FakeStream {
    fn capture(&mut self) -> BoxFuture<'_, Result<EncodedImage, CaptureError>> {
        async move {
            if self.broken {
                return Err(CaptureError::Camera("device unplugged".into()));
            }
            self.shots += 1;
            Ok(EncodedImage::jpeg(vec![0xFF, 0xD8, self.shots, 0xFF, 0xD9]))
        }
        .boxed()
    }
}

impl Camera for FakeCamera {
    fn open(&self) -> BoxFuture<'_, Result<Box<dyn CameraStream>, CaptureError>> {
        async move {
            if self.deny {
                return Err(CaptureError::PermissionDenied {
                    device: "camera",
                    details: "blocked".into(),
                });
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeStream {
                live: self.live.clone(),
                shots: 0,
                broken: self.broken,
            }) as Box<dyn CameraStream>)
        }
        .boxed()
    }
}

pub enum Script {
    Events(Vec<RecognitionEvent>),
    Deny,
}

/// Recognizer double that replays a script once. The returned flag is set
/// when the recognition handle is stopped.
pub struct FakeRecognizer {
    script: Mutex<Option<Script>>,
    stopped: Arc<AtomicBool>,
}

impl FakeRecognizer {
    pub fn new(script: Script) -> (Self, Arc<AtomicBool>) {
        let stopped = Arc::new(AtomicBool::new(false));
        (
            Self {
                script: Mutex::new(Some(script)),
                stopped: stopped.clone(),
            },
            stopped,
        )
    }
}

struct FakeHandle {
    stopped: Arc<AtomicBool>,
    _events: mpsc::Sender<RecognitionEvent>,
}

impl ActiveRecognition for FakeHandle {
    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

impl SpeechRecognizer for FakeRecognizer {
    fn start(
        &self,
        events: mpsc::Sender<RecognitionEvent>,
    ) -> BoxFuture<'_, Result<Box<dyn ActiveRecognition>, CaptureError>> {
        async move {
            match self.script.lock().unwrap().take() {
                Some(Script::Deny) => Err(CaptureError::PermissionDenied {
                    device: "microphone",
                    details: "refused".into(),
                }),
                Some(Script::Events(list)) => {
                    for e in list {
                        events.try_send(e).unwrap();
                    }
                    Ok(Box::new(FakeHandle {
                        stopped: self.stopped.clone(),
                        _events: events,
                    }) as Box<dyn ActiveRecognition>)
                }
                None => panic!("started twice"),
            }
        }
        .boxed()
    }
}
