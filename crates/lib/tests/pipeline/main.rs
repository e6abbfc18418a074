//! End-to-end tests of the event pipeline against in-process backends.

mod common;
mod deploy_tests;
mod ingress_tests;
