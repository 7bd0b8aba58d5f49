// Order lifecycle module
// Owns all per-symbol position and order state; nothing else mutates it.

pub mod lifecycle;

pub use lifecycle::{CycleEvent, LifecycleManager, Phase};
