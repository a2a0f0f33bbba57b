//! Integration tests

mod test_engine;
mod test_fsm;
mod test_state_store;
