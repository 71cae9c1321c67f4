mod idle;
pub(crate) use self::idle::IdleSignal;

mod scope_guard;
pub(crate) use self::scope_guard::ScopeGuard;
