use std::{fs::File, io::BufReader};

use rodio::{Decoder, OutputStream, Sink, Source};

use super::{AudioBackend, AudioTransport, OpenRequest};
use crate::error::AudioOpenError;

/// Plays the session track on the default output device.
#[derive(Debug, Clone, Copy, Default)]
pub struct RodioBackend;

impl AudioBackend for RodioBackend {
    fn open(&mut self, request: &OpenRequest<'_>) -> Result<Box<dyn AudioTransport>, AudioOpenError> {
        let fail = |reason: String| AudioOpenError::new(request.path, reason);

        let file = File::open(request.path).map_err(|err| fail(err.to_string()))?;
        let source = Decoder::new(BufReader::new(file)).map_err(|err| fail(err.to_string()))?;
        let duration_ms = source.total_duration().map(|d| d.as_millis() as u64);

        let (stream, handle) = OutputStream::try_default().map_err(|err| fail(err.to_string()))?;
        let sink = Sink::try_new(&handle).map_err(|err| fail(err.to_string()))?;
        sink.append(source);

        tracing::info!(path = %request.path.display(), ?duration_ms, "audio output started");
        Ok(Box::new(RodioTransport {
            _stream: stream,
            sink,
            duration_ms,
        }))
    }
}

struct RodioTransport {
    // Output stops when the stream is dropped.
    _stream: OutputStream,
    sink: Sink,
    duration_ms: Option<u64>,
}

impl AudioTransport for RodioTransport {
    fn position_ms(&self) -> u64 {
        self.sink.get_pos().as_millis() as u64
    }

    fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    fn is_finished(&self) -> bool {
        self.sink.empty()
    }

    fn pause(&mut self) {
        self.sink.pause();
    }

    fn resume(&mut self) {
        self.sink.play();
    }

    fn stop(&mut self) {
        self.sink.stop();
    }
}
