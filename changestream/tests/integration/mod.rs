mod invalidation_test;
mod options_test;
mod ordering_test;
mod resumption_test;
mod shard_lifecycle_test;
