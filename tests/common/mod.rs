#![allow(dead_code)]

pub use fanout_test_utils::builders::{Fleet, WebTreeBuilder, config, dispatcher, multiplexer};
pub use fanout_test_utils::{
    FakeTarget, PtyScript, ScriptedPrompter, eventually, init_tracing, with_timeout,
};

use fanout::engine::InvocationResult;

/// `(label, output)` of every succeeded cell, in order.
pub fn outputs(result: &InvocationResult) -> Vec<(String, String)> {
    result
        .outcomes()
        .iter()
        .filter_map(|o| o.output().map(|out| (o.label.clone(), out.to_string())))
        .collect()
}
