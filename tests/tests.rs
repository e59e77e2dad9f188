//! Run with `cargo test --all-features`.

use plexus::nodes::{Add, Collect, Frame, TimeWarp};
use plexus::{Context, Engine, Graph, PlugSpec, Value, ValueType};
use serial_test::serial;

macro_rules! test {
    (miss: $call:expr, $result:expr) => {{
        assert_eq!($call, $result);
        assert!(!plexus::testing::last_was_hit());
    }};
    (hit: $call:expr, $result:expr) => {{
        assert_eq!($call, $result);
        assert!(plexus::testing::last_was_hit());
    }};
}

/// Test a chain of additions fed by a container.
#[test]
#[serial]
fn test_chain() {
    let graph = Graph::new();
    let a = graph.add_container("a").unwrap();
    let value = graph.add_plug(a, PlugSpec::output("value", ValueType::Float)).unwrap();
    let b = graph.add_node("b", Add::new(0.0)).unwrap();
    let c = graph.add_node("c", Add::new(10.0)).unwrap();
    graph.set_input(graph.plug(b, "in1").unwrap(), Some(value)).unwrap();
    graph.set_input(graph.plug(c, "in1").unwrap(), graph.plug(b, "sum").ok()).unwrap();

    let sum = graph.plug(c, "sum").unwrap();
    let context = Context::new();
    let eval = || graph.value(sum, &context).unwrap();

    graph.set_value(value, 5.0.into()).unwrap();
    test!(miss: eval(), Value::Float(15.0));
    test!(hit: eval(), Value::Float(15.0));

    graph.set_value(value, 5.0.into()).unwrap();
    test!(hit: eval(), Value::Float(15.0));

    graph.set_value(value, 6.0.into()).unwrap();
    test!(miss: eval(), Value::Float(16.0));
    test!(hit: eval(), Value::Float(16.0));

    // Going back to an earlier state finds the earlier value.
    graph.set_value(value, 5.0.into()).unwrap();
    test!(hit: eval(), Value::Float(15.0));
}

/// Test that contexts produce independent cache entries.
#[test]
#[serial]
fn test_frames() {
    let graph = Graph::new();
    let frame = graph.add_node("frame", Frame).unwrap();
    let out = graph.plug(frame, "out").unwrap();

    let mut one = Context::new();
    one.set_frame(1.0);
    let mut two = Context::new();
    two.set_frame(2.0);

    test!(miss: graph.value(out, &one).unwrap(), Value::Float(1.0));
    test!(miss: graph.value(out, &two).unwrap(), Value::Float(2.0));
    test!(hit: graph.value(out, &one).unwrap(), Value::Float(1.0));
    test!(hit: graph.value(out, &two).unwrap(), Value::Float(2.0));

    // Variables the plug doesn't hash don't matter.
    test!(hit: graph.value(out, &one.with("other", 1)).unwrap(), Value::Float(1.0));

    Engine::shared().clear_cache();
    test!(miss: graph.value(out, &one).unwrap(), Value::Float(1.0));
    test!(miss: graph.value(out, &two).unwrap(), Value::Float(2.0));
    test!(hit: graph.value(out, &one).unwrap(), Value::Float(1.0));
}

/// Test that a time warp reuses the values of the frames it maps to.
#[test]
#[serial]
fn test_time_warp() {
    let graph = Graph::new();
    let frame = graph.add_node("frame", Frame).unwrap();
    let warp = graph.add_node("warp", TimeWarp::new(ValueType::Float)).unwrap();
    graph
        .set_input(graph.plug(warp, "in").unwrap(), graph.plug(frame, "out").ok())
        .unwrap();
    graph.set_value(graph.plug(warp, "speed").unwrap(), 2.0.into()).unwrap();
    graph.set_value(graph.plug(warp, "offset").unwrap(), 1.0.into()).unwrap();

    let warped = graph.plug(warp, "out").unwrap();
    let direct = graph.plug(frame, "out").unwrap();
    let mut context = Context::new();
    context.set_frame(3.0);

    test!(miss: graph.value(warped, &context).unwrap(), Value::Float(7.0));
    context.set_frame(7.0);
    test!(hit: graph.value(direct, &context).unwrap(), Value::Float(7.0));
}

/// Test that collected values are shared with direct evaluation.
#[test]
#[serial]
fn test_collect() {
    let graph = Graph::new();
    let frame = graph.add_node("frame", Frame).unwrap();
    let warp = graph.add_node("warp", TimeWarp::new(ValueType::Float)).unwrap();
    let collect = graph.add_node("collect", Collect::new(ValueType::Float)).unwrap();
    graph
        .set_input(graph.plug(warp, "in").unwrap(), graph.plug(frame, "out").ok())
        .unwrap();
    graph
        .set_input(graph.plug(collect, "in").unwrap(), graph.plug(warp, "out").ok())
        .unwrap();
    graph
        .set_value(graph.plug(collect, "values").unwrap(), vec!["a", "b", "c"].into())
        .unwrap();

    let out = graph.plug(collect, "out").unwrap();
    let context = Context::new();
    test!(miss: graph.value(out, &context).unwrap(), Value::from(vec![1.0, 1.0, 1.0]));
    test!(hit: graph.value(out, &context).unwrap(), Value::from(vec![1.0, 1.0, 1.0]));

    let warped = graph.plug(warp, "out").unwrap();
    let collected = context.with("collect:value", "b");
    test!(hit: graph.value(warped, &collected).unwrap(), Value::Float(1.0));
}
