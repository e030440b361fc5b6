//! Protocol drivers built on the operation engine.

pub mod control;
