pub mod test_timeout;
