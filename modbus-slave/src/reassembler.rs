//! Reconstruction of RTU frames from a delimiter-free serial byte stream.
//!
//! The [`Reassembler`] is fed the outcome of every bounded-timeout read on a port:
//! the bytes read, or an empty slice when the read timed out (line silence). It owns
//! the [`ListenState`] of exactly one port and yields candidate frames; checking them
//! is left to [`crate::frame::RtuFrame::decode`].
//!
//! Where one frame ends is decided by a [`FrameBoundary`] policy:
//! - [`FixedPrefix`] reads an 8 byte prefix and derives the frame length from the
//!   function code,
//! - [`Silence`] ends a frame at the first empty read after data.

use std::fmt::Debug;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::frame::RTU_MAX_LEN;
use crate::function::{WRITE_MULTIPLE_COILS, WRITE_MULTIPLE_REGISTERS};

/// Selects the [`FrameBoundary`] used on a port.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    FixedPrefix,
    #[default]
    Silence,
}

impl Framing {
    pub fn boundary(self) -> Box<dyn FrameBoundary> {
        match self {
            Framing::FixedPrefix => Box::new(FixedPrefix),
            Framing::Silence => Box::new(Silence),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Discard everything until the line goes quiet.
    Idle,
    /// Collect bytes of the current frame.
    Accumulating,
    /// A candidate frame is complete.
    Ready,
}

/// Receive state of one serial port.
#[derive(Debug, Clone)]
pub struct ListenState {
    pub phase: Phase,
    pub packet: Vec<u8>,
    /// Bytes still expected once the frame length is known.
    pub bytes_left: usize,
    /// More bytes arrived than the frame could hold; the line must be flushed.
    pub has_err: bool,
}

impl Default for ListenState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            packet: Vec::with_capacity(RTU_MAX_LEN),
            bytes_left: 0,
            has_err: false,
        }
    }
}

impl ListenState {
    /// Forget the current attempt and start collecting a new frame.
    pub fn start_frame(&mut self) {
        self.phase = Phase::Accumulating;
        self.packet.clear();
        self.bytes_left = 0;
        self.has_err = false;
    }

    /// Drop the current attempt and drain the line.
    pub fn flush(&mut self) {
        self.start_frame();
        self.phase = Phase::Idle;
    }
}

/// Frame delimiting policy. Only called while the state is [`Phase::Accumulating`].
pub trait FrameBoundary: Debug + Send + Sync {
    /// Take newly read, non-empty `data`.
    fn accumulate(&self, state: &mut ListenState, data: &[u8]);

    /// A read returned nothing within its timeout.
    fn silence(&self, state: &mut ListenState);

    /// The last candidate frame failed to decode.
    fn reject(&self, state: &mut ListenState) {
        state.flush();
    }
}

/// Length derived from the first 8 bytes: function codes 1 to 6 are complete at
/// 8 bytes, 15 and 16 carry a byte count at offset 6. Anything else, including
/// broadcast (address 0) frames, flushes the line.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedPrefix;

const PREFIX_LEN: usize = 8;
const BYTE_COUNT_OFFSET: usize = 6;

impl FrameBoundary for FixedPrefix {
    fn accumulate(&self, state: &mut ListenState, mut data: &[u8]) {
        if state.packet.len() < PREFIX_LEN {
            let take = (PREFIX_LEN - state.packet.len()).min(data.len());
            state.packet.extend_from_slice(&data[..take]);
            data = &data[take..];
            if state.packet.len() < PREFIX_LEN {
                return;
            }

            match (state.packet[0], state.packet[1]) {
                (0, _) => {
                    debug!("broadcast frame ignored, flushing line");
                    state.flush();
                    return;
                }
                (_, 0x01..=0x06) => state.bytes_left = 0,
                (_, WRITE_MULTIPLE_COILS | WRITE_MULTIPLE_REGISTERS) => {
                    // values and the second CRC byte
                    state.bytes_left = state.packet[BYTE_COUNT_OFFSET] as usize + 1;
                }
                (_, function) => {
                    debug!("function {function:#04x} has no known length, flushing line");
                    state.flush();
                    return;
                }
            }
        }

        let take = state.bytes_left.min(data.len());
        state.packet.extend_from_slice(&data[..take]);
        state.bytes_left -= take;
        if state.bytes_left == 0 {
            state.has_err = data.len() > take;
            state.phase = Phase::Ready;
        }
    }

    fn silence(&self, state: &mut ListenState) {
        if !state.packet.is_empty() {
            debug!("incomplete frame of {} bytes dropped", state.packet.len());
            state.start_frame();
        }
    }
}

/// A frame ends when the line goes quiet after at least one byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct Silence;

impl FrameBoundary for Silence {
    fn accumulate(&self, state: &mut ListenState, data: &[u8]) {
        if state.packet.len() + data.len() > RTU_MAX_LEN {
            debug!("frame exceeds {RTU_MAX_LEN} bytes, flushing line");
            state.flush();
            return;
        }
        state.packet.extend_from_slice(data);
    }

    fn silence(&self, state: &mut ListenState) {
        if !state.packet.is_empty() {
            state.phase = Phase::Ready;
        }
    }

    fn reject(&self, state: &mut ListenState) {
        // the bad frame was already delimited by silence
        state.start_frame();
    }
}

/// Per-port frame reassembly.
#[derive(Debug)]
pub struct Reassembler {
    boundary: Box<dyn FrameBoundary>,
    state: ListenState,
}

impl Reassembler {
    pub fn new(framing: Framing) -> Self {
        Self::with_boundary(framing.boundary())
    }

    pub fn with_boundary(boundary: Box<dyn FrameBoundary>) -> Self {
        Self {
            boundary,
            state: ListenState::default(),
        }
    }

    pub fn state(&self) -> &ListenState {
        &self.state
    }

    /// Feed the result of one read; an empty `data` means the read timed out.
    ///
    /// Returns the bytes of a candidate frame once one is complete.
    pub fn push(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        match self.state.phase {
            Phase::Idle => {
                if data.is_empty() {
                    self.state.start_frame();
                }
            }
            Phase::Accumulating if data.is_empty() => self.boundary.silence(&mut self.state),
            Phase::Accumulating => self.boundary.accumulate(&mut self.state, data),
            Phase::Ready => {}
        }

        if self.state.phase != Phase::Ready {
            return None;
        }

        let packet = std::mem::take(&mut self.state.packet);
        if self.state.has_err {
            self.state.flush();
        } else {
            self.state.start_frame();
        }
        Some(packet)
    }

    /// Report that the last candidate did not decode.
    pub fn reject(&mut self) {
        self.boundary.reject(&mut self.state);
    }
}
