//! Reassembly of fragmented input into whole access units.

use bytes::BytesMut;

use crate::frame::MediaFrame;

/// Receives one merged access unit: dts, pts, payload, contains a key frame.
pub type MergedSink<'a> = dyn FnMut(i64, i64, &[u8], bool) + 'a;

pub trait FrameMerger: Send {
    /// Buffers `frame`; `out` fires for every access unit it completes.
    fn input_frame(&mut self, frame: &dyn MediaFrame, out: &mut MergedSink<'_>) -> bool;
    /// Emits whatever is still buffered.
    fn flush(&mut self, out: &mut MergedSink<'_>);
}

/// Treats chunks with the same dts as slices of one access unit. The unit is
/// complete once a chunk with a different dts arrives.
#[derive(Debug, Default)]
pub struct DtsMerger {
    buffer: BytesMut,
    dts: i64,
    pts: i64,
    have_key: bool,
}

impl DtsMerger {
    pub fn new() -> Self {
        Self::default()
    }

    fn emit(&mut self, out: &mut MergedSink<'_>) {
        if self.buffer.is_empty() {
            return;
        }
        let unit = self.buffer.split().freeze();
        out(self.dts, self.pts, &unit, self.have_key);
        self.have_key = false;
    }
}

impl FrameMerger for DtsMerger {
    fn input_frame(&mut self, frame: &dyn MediaFrame, out: &mut MergedSink<'_>) -> bool {
        if !self.buffer.is_empty() && frame.dts() != self.dts {
            self.emit(out);
        }
        if self.buffer.is_empty() {
            self.dts = frame.dts();
            self.pts = frame.pts();
        }
        self.have_key |= frame.key_frame();
        self.buffer.extend_from_slice(frame.data());
        true
    }

    fn flush(&mut self, out: &mut MergedSink<'_>) {
        self.emit(out);
    }
}
