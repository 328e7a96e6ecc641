pub mod test_join_group;
pub mod test_partial_failure;
