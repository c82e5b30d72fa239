// tests/integration/mod.rs
// Integration test modules

#[cfg(test)]
pub mod mock;

#[cfg(test)]
pub mod test_slot_cycle;

#[cfg(test)]
pub mod test_cycle_finalization;
