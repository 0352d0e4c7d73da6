pub mod accumulate;
pub use accumulate::{
    accumulate, accumulate_into_slice, accumulate_ring, accumulate_with_kernel, AccumulateBuilder,
    AccumulateError, AccumulateInput, AccumulateOutput, AccumulateParams,
};
pub mod periodic;
pub use periodic::{betatron_phase, fractional_tunes, periodic_twiss, BetatronPhase, PeriodicError, Stability, Tunes};
pub mod ranges;
pub use ranges::{
    accumulate_ranges, accumulate_ranges_into_slice, accumulate_ranges_with_kernel,
    AccumulateRangesBuilder, AccumulateRangesInput, AccumulateRangesOutput, IndexRange,
};
pub mod ring;
pub use ring::{RingError, RingOptics};
pub mod twiss;
pub use twiss::{
    propagate_envelope, propagate_envelope_with_kernel, propagate_twiss, propagate_twiss_into_slice,
    propagate_twiss_with_kernel, twiss_transform, TwissBuilder, TwissError, TwissInput, TwissOutput,
    TwissParams, TwissVector,
};
