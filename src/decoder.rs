//! Decodificador incremental de NDJSON para el cliente.

use std::marker::PhantomData;

use tracing::warn;

use crate::error::StreamProtocolError;
use crate::stream::{Detected, StreamEvent};

/// Buffer de líneas sobre bytes: una línea partida entre dos trozos, o un
/// carácter UTF-8 partido, se completa con el siguiente `push`.
///
/// Tras el primer evento terminal el decodificador se cierra y descarta
/// todo lo que llegue después.
#[derive(Debug)]
pub struct NdjsonDecoder<T> {
    buffer: Vec<u8>,
    skipped: usize,
    closed: bool,
    _event: PhantomData<fn() -> T>,
}

impl<T> Default for NdjsonDecoder<T> {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            skipped: 0,
            closed: false,
            _event: PhantomData,
        }
    }
}

impl<T: Detected> NdjsonDecoder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Añade un trozo del cuerpo y devuelve los eventos de las líneas completas.
    /// Las líneas mal formadas se registran y se descartan.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent<T>> {
        let mut events = Vec::new();
        if self.closed {
            return events;
        }
        self.buffer.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let line_start = start;
            let end = start + offset;
            start = end + 1;
            if let Some(event) = self.decode_line(line_start, end) {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    self.close();
                    return events;
                }
            }
        }
        self.buffer.drain(..start);
        events
    }

    /// Interpreta lo que quede en el buffer como una última línea sin `\n`.
    pub fn finish(&mut self) -> Option<StreamEvent<T>> {
        if self.closed {
            return None;
        }
        let end = self.buffer.len();
        let event = self.decode_line(0, end);
        self.buffer.clear();
        event
    }

    fn close(&mut self) {
        self.closed = true;
        self.buffer.clear();
    }

    /// Líneas descartadas hasta ahora.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn decode_line(&mut self, start: usize, end: usize) -> Option<StreamEvent<T>> {
        let raw = &self.buffer[start..end];
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line.trim(),
            Err(e) => {
                self.skip(StreamProtocolError::InvalidJson(e.to_string()));
                return None;
            }
        };
        if line.is_empty() {
            return None;
        }
        match StreamEvent::from_line(line) {
            Ok(event) => Some(event),
            Err(e) => {
                self.skip(e);
                None
            }
        }
    }

    fn skip(&mut self, err: StreamProtocolError) {
        self.skipped += 1;
        warn!("Línea del stream ignorada: {}", err);
    }
}
