use bitflags::bitflags;

/// Counts worker loop iterations and turns them into periodic events.
#[derive(Debug, Default)]
pub(crate) struct Ticker {
    tick: u32,
}

impl Ticker {
    pub(crate) fn new() -> Self {
        Self { tick: 0 }
    }

    pub(crate) fn tick<T: TickerData>(&mut self, ctx: &T::Context, data: &mut T) -> TickerEvents {
        self.tick = self.tick.wrapping_add(1);
        data.update_and_check(ctx, self.tick)
    }
}

/// Implemented by the worker policy, which owns the decision of what a tick
/// means. Keeps the counter separate from the logic.
pub(crate) trait TickerData {
    type Context;

    fn update_and_check(&mut self, ctx: &Self::Context, tick: u32) -> TickerEvents;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub(crate) struct TickerEvents: u8 {
        /// Take the next task from the pool-wide queue before the local one.
        const POP_GLOBAL_QUEUE = 1;

        /// The pool is shutting down, leave the loop.
        const SHUTDOWN = 1 << 1;
    }
}
