//! Software white balance through the gain LUTs, and the frame stack it is applied to.

use crate::color::lut::GainLutCache;
use crate::data::decoder::DecodedFrame;
use crate::error::{CaptureError, CaptureResult};
use ndarray::{s, Array3, Array4, ArrayViewMut3, Axis};

/// Pixel sample types the LUTs cover.
pub trait Sample: Copy + PartialEq + std::fmt::Debug {
    /// Largest representable value; selects the LUT family.
    const MAX: u32;
    /// Value as a table index.
    fn index(self) -> usize;
    /// Value from a table entry (always `<= MAX`).
    fn from_table(v: u16) -> Self;
}

impl Sample for u8 {
    const MAX: u32 = 255;

    fn index(self) -> usize {
        self as usize
    }

    fn from_table(v: u16) -> Self {
        v.min(255) as u8
    }
}

impl Sample for u16 {
    const MAX: u32 = 65535;

    fn index(self) -> usize {
        self as usize
    }

    fn from_table(v: u16) -> Self {
        v
    }
}

/// Per-channel gains, RGB order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WhiteBalanceGains {
    /// Red gain
    pub red: f64,
    /// Green gain
    pub green: f64,
    /// Blue gain
    pub blue: f64,
}

impl WhiteBalanceGains {
    /// Unity gains.
    pub const NEUTRAL: WhiteBalanceGains = WhiteBalanceGains {
        red: 1.0,
        green: 1.0,
        blue: 1.0,
    };

    /// Create gains.
    pub fn new(red: f64, green: f64, blue: f64) -> Self {
        Self { red, green, blue }
    }

    /// Gains from slider positions in `0..=slider_max`; each slider maps to `1 + pos / max`.
    pub fn from_sliders(red: u32, green: u32, blue: u32, slider_max: u32) -> Self {
        let max = f64::from(slider_max.max(1));
        Self::new(
            1.0 + f64::from(red) / max,
            1.0 + f64::from(green) / max,
            1.0 + f64::from(blue) / max,
        )
    }
}

/// Substitute each channel of an `(h, w, 3)` frame through its gain's LUT, in place.
pub fn apply_white_balance<T: Sample>(
    mut frame: ArrayViewMut3<'_, T>,
    gains: WhiteBalanceGains,
    luts: &GainLutCache,
) -> CaptureResult<()> {
    let channels = frame.len_of(Axis(2));
    if channels != 3 {
        return Err(CaptureError::UnsupportedFormat(format!(
            "white balance needs 3 channels, frame has {channels}"
        )));
    }

    for (channel, gain) in [gains.red, gains.green, gains.blue].into_iter().enumerate() {
        let lut = luts.lut(T::MAX, gain);
        let table = lut.table();
        frame
            .index_axis_mut(Axis(2), channel)
            .mapv_inplace(|v| T::from_table(table[v.index()]));
    }
    Ok(())
}

/// White balance the newest slice of an `(n, h, w, 3)` stack. Earlier slices are untouched.
pub fn apply_white_balance_stack<T: Sample>(
    stack: &mut Array4<T>,
    gains: WhiteBalanceGains,
    luts: &GainLutCache,
) -> CaptureResult<()> {
    let n = stack.len_of(Axis(0));
    if n == 0 {
        return Ok(());
    }
    apply_white_balance(stack.index_axis_mut(Axis(0), n - 1), gains, luts)
}

/// White balance a decoded color frame in place; mono frames are rejected.
pub fn apply_to_frame(
    frame: &mut DecodedFrame,
    gains: WhiteBalanceGains,
    luts: &GainLutCache,
) -> CaptureResult<()> {
    match frame {
        DecodedFrame::Color8(a) => apply_white_balance(a.view_mut(), gains, luts),
        DecodedFrame::Color16(a) => apply_white_balance(a.view_mut(), gains, luts),
        DecodedFrame::Mono8(_) | DecodedFrame::Mono16(_) => Err(CaptureError::UnsupportedFormat(
            "white balance needs a 3-channel frame".into(),
        )),
    }
}

/// Time sequence of 3-channel frames, `(index, height, width, 3)`.
///
/// Mono frames are replicated into three channels. A frame whose size or sample type differs
/// from the stack restarts it.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameStack {
    /// Nothing yet
    Empty,
    /// 8-bit frames
    Stack8(Array4<u8>),
    /// 16-bit frames
    Stack16(Array4<u16>),
}

impl Default for FrameStack {
    fn default() -> Self {
        FrameStack::Empty
    }
}

impl FrameStack {
    /// Append a frame, keeping at most `max_len` slices (oldest dropped first).
    pub fn push(&mut self, frame: &DecodedFrame, max_len: usize) {
        let max_len = max_len.max(1);
        match frame {
            DecodedFrame::Mono8(a) => {
                let rgb = replicate(a.view());
                push_slice8(self, rgb, max_len);
            }
            DecodedFrame::Color8(a) => push_slice8(self, a.clone(), max_len),
            DecodedFrame::Mono16(a) => {
                let rgb = replicate(a.view());
                push_slice16(self, rgb, max_len);
            }
            DecodedFrame::Color16(a) => push_slice16(self, a.clone(), max_len),
        }
    }

    /// Number of slices.
    pub fn len(&self) -> usize {
        match self {
            FrameStack::Empty => 0,
            FrameStack::Stack8(a) => a.len_of(Axis(0)),
            FrameStack::Stack16(a) => a.len_of(Axis(0)),
        }
    }

    /// True when no slices are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// White balance the newest slice.
    pub fn white_balance_latest(
        &mut self,
        gains: WhiteBalanceGains,
        luts: &GainLutCache,
    ) -> CaptureResult<()> {
        match self {
            FrameStack::Empty => Ok(()),
            FrameStack::Stack8(a) => apply_white_balance_stack(a, gains, luts),
            FrameStack::Stack16(a) => apply_white_balance_stack(a, gains, luts),
        }
    }

    /// Drop all slices.
    pub fn clear(&mut self) {
        *self = FrameStack::Empty;
    }
}

fn replicate<T: Copy>(mono: ndarray::ArrayView2<'_, T>) -> Array3<T> {
    let (h, w) = mono.dim();
    Array3::from_shape_fn((h, w, 3), |(y, x, _)| mono[[y, x]])
}

fn push_slice8(stack: &mut FrameStack, slice: Array3<u8>, max_len: usize) {
    match stack {
        FrameStack::Stack8(a) if a.shape()[1..] == *slice.shape() => {
            append(a, slice, max_len);
        }
        _ => *stack = FrameStack::Stack8(slice.insert_axis(Axis(0))),
    }
}

fn push_slice16(stack: &mut FrameStack, slice: Array3<u16>, max_len: usize) {
    match stack {
        FrameStack::Stack16(a) if a.shape()[1..] == *slice.shape() => {
            append(a, slice, max_len);
        }
        _ => *stack = FrameStack::Stack16(slice.insert_axis(Axis(0))),
    }
}

fn append<T: Clone>(stack: &mut Array4<T>, slice: Array3<T>, max_len: usize) {
    if stack.len_of(Axis(0)) >= max_len {
        let keep = max_len - 1;
        let start = stack.len_of(Axis(0)) - keep;
        *stack = stack.slice(s![start.., .., .., ..]).to_owned();
    }
    // shapes already checked by the caller
    if stack.push(Axis(0), slice.view()).is_err() {
        *stack = slice.insert_axis(Axis(0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::lut::{GainGrid, GainLut};
    use ndarray::Array2;

    fn luts() -> GainLutCache {
        GainLutCache::build(GainGrid {
            start: 0.5,
            end: 2.0,
            step: 0.25,
        })
    }

    #[test]
    fn single_frame_matches_direct_lut_application() {
        let luts = luts();
        let original = Array3::from_shape_fn((4, 5, 3), |(y, x, c)| ((y * 50 + x * 10 + c) % 256) as u8);
        let mut frame = original.clone();
        let gains = WhiteBalanceGains::new(1.5, 1.0, 0.75);
        apply_white_balance(frame.view_mut(), gains, &luts).unwrap();

        let r = GainLut::compute(255, 1.5);
        let b = GainLut::compute(255, 0.75);
        for ((y, x, c), v) in frame.indexed_iter() {
            let src = u32::from(original[[y, x, c]]);
            let expected = match c {
                0 => r.apply(src),
                1 => src as u16,
                _ => b.apply(src),
            };
            assert_eq!(u16::from(*v), expected);
        }
    }

    #[test]
    fn sixteen_bit_frames_use_wide_tables() {
        let luts = luts();
        let mut frame = Array3::<u16>::from_elem((2, 2, 3), 40_000);
        apply_white_balance(frame.view_mut(), WhiteBalanceGains::new(2.0, 1.0, 0.5), &luts).unwrap();
        assert_eq!(frame[[0, 0, 0]], 65535);
        assert_eq!(frame[[0, 0, 1]], 40_000);
        assert_eq!(frame[[0, 0, 2]], 20_000);
    }

    #[test]
    fn only_last_slice_of_stack_changes() {
        let luts = luts();
        let mut stack = Array4::<u8>::from_elem((3, 2, 2, 3), 100);
        apply_white_balance_stack(&mut stack, WhiteBalanceGains::new(1.5, 1.5, 1.5), &luts).unwrap();

        assert!(stack.index_axis(Axis(0), 0).iter().all(|v| *v == 100));
        assert!(stack.index_axis(Axis(0), 1).iter().all(|v| *v == 100));
        assert!(stack.index_axis(Axis(0), 2).iter().all(|v| *v == 150));
    }

    #[test]
    fn mono_frames_are_rejected() {
        let luts = luts();
        let mut frame = DecodedFrame::Mono8(Array2::zeros((2, 2)));
        assert!(matches!(
            apply_to_frame(&mut frame, WhiteBalanceGains::NEUTRAL, &luts),
            Err(CaptureError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn slider_gains() {
        let gains = WhiteBalanceGains::from_sliders(0, 128, 256, 256);
        assert_eq!(gains, WhiteBalanceGains::new(1.0, 1.5, 2.0));
    }

    #[test]
    fn stack_replicates_mono_and_resets_on_shape_change() {
        let mut stack = FrameStack::default();
        let mono = DecodedFrame::Mono8(Array2::from_elem((2, 3), 9));
        stack.push(&mono, 10);
        stack.push(&mono, 10);
        assert_eq!(stack.len(), 2);
        let FrameStack::Stack8(a) = &stack else {
            panic!("expected 8-bit stack");
        };
        assert_eq!(a.dim(), (2, 2, 3, 3));
        assert!(a.iter().all(|v| *v == 9));

        stack.push(&DecodedFrame::Mono8(Array2::zeros((4, 4))), 10);
        assert_eq!(stack.len(), 1);

        stack.push(&DecodedFrame::Mono16(Array2::zeros((4, 4))), 10);
        assert!(matches!(stack, FrameStack::Stack16(_)));
    }

    #[test]
    fn stack_is_bounded() {
        let mut stack = FrameStack::default();
        for i in 0..5u8 {
            stack.push(&DecodedFrame::Mono8(Array2::from_elem((1, 1), i)), 3);
        }
        assert_eq!(stack.len(), 3);
        let FrameStack::Stack8(a) = &stack else {
            panic!("expected 8-bit stack");
        };
        assert_eq!(a[[0, 0, 0, 0]], 2);
        assert_eq!(a[[2, 0, 0, 0]], 4);
    }

    #[test]
    fn stack_white_balance_touches_newest_only() {
        let luts = luts();
        let mut stack = FrameStack::default();
        for _ in 0..3 {
            stack.push(&DecodedFrame::Color8(Array3::from_elem((1, 1, 3), 100)), 8);
        }
        stack
            .white_balance_latest(WhiteBalanceGains::new(2.0, 2.0, 2.0), &luts)
            .unwrap();
        let FrameStack::Stack8(a) = &stack else {
            panic!("expected 8-bit stack");
        };
        assert_eq!(a[[0, 0, 0, 0]], 100);
        assert_eq!(a[[2, 0, 0, 0]], 200);
    }
}
