mod scenarios;

pub(crate) use mock_store::{MockOutcome, MockStore};
