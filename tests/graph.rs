use std::sync::Arc;

use plexus::nodes::Add;
use plexus::{
    Accumulator, Compute, ComputeContext, Context, Direction, Engine, EngineConfig, Error, Graph,
    HashContext, PlugFlags, PlugInfo, PlugSpec, Result, Value, ValueType,
};
use quickcheck_macros::quickcheck;

fn graph() -> Graph {
    Graph::with_engine(Arc::new(Engine::new(EngineConfig::default())))
}

/// Only takes inputs from plugs whose names start with "ok".
struct Picky;

impl Compute for Picky {
    fn plugs(&self) -> Vec<PlugSpec> {
        vec![PlugSpec::input("in", ValueType::Float), PlugSpec::output("out", ValueType::Float)]
    }

    fn affects(&self, input: &str) -> Vec<&str> {
        if input == "in" { vec!["out"] } else { vec![] }
    }

    fn hash(&self, _: &str, cx: &HashContext, h: &mut Accumulator) -> Result<()> {
        h.append_fingerprint(cx.hash("in")?);
        Ok(())
    }

    fn compute(&self, _: &str, cx: &ComputeContext) -> Result<Value> {
        cx.value("in")
    }

    fn accepts_input(&self, _: &str, source: &PlugInfo) -> bool {
        source.full_name.split('.').next_back().is_some_and(|name| name.starts_with("ok"))
    }
}

#[test]
fn test_connect_and_disconnect() {
    let graph = graph();
    let src = graph.add_container("src").unwrap();
    let out = graph.add_plug(src, PlugSpec::output("out", ValueType::Int)).unwrap();
    let add = graph.add_node("add", Add::new(0.5)).unwrap();
    let in1 = graph.plug(add, "in1").unwrap();
    let sum = graph.plug(add, "sum").unwrap();

    graph.set_input(in1, Some(out)).unwrap();
    assert_eq!(graph.input(in1).unwrap(), Some(out));
    assert_eq!(graph.outputs(out).unwrap(), vec![in1]);
    assert_eq!(graph.source(in1).unwrap(), out);

    graph.set_value(out, 3.into()).unwrap();
    assert_eq!(graph.value(sum, &Context::new()).unwrap(), Value::Float(3.5));

    graph.set_input(in1, None).unwrap();
    assert_eq!(graph.input(in1).unwrap(), None);
    assert!(graph.outputs(out).unwrap().is_empty());
    assert_eq!(graph.value(sum, &Context::new()).unwrap(), Value::Float(0.5));
}

#[test]
fn test_type_mismatch() {
    let graph = graph();
    let src = graph.add_container("src").unwrap();
    let text = graph.add_plug(src, PlugSpec::output("text", ValueType::String)).unwrap();
    let add = graph.add_node("add", Add::default()).unwrap();
    let in1 = graph.plug(add, "in1").unwrap();

    assert!(!graph.accepts_input(in1, text));
    assert!(matches!(graph.set_input(in1, Some(text)), Err(Error::TypeMismatch { .. })));
    assert_eq!(graph.input(in1).unwrap(), None);

    assert!(matches!(graph.set_value(in1, "one".into()), Err(Error::TypeMismatch { .. })));
}

#[test]
fn test_numeric_conversion() {
    let graph = graph();
    let src = graph.add_container("src").unwrap();
    let float = graph.add_plug(src, PlugSpec::output("float", ValueType::Float)).unwrap();
    let dst = graph.add_container("dst").unwrap();
    let int = graph.add_plug(dst, PlugSpec::input("int", ValueType::Int)).unwrap();

    graph.set_input(int, Some(float)).unwrap();
    graph.set_value(float, 2.75.into()).unwrap();

    let context = Context::new();
    assert_eq!(graph.value(int, &context).unwrap(), Value::Int(2));
    assert_ne!(graph.hash(int, &context).unwrap(), graph.hash(float, &context).unwrap());

    // Setting values converts too.
    let other = graph.add_plug(dst, PlugSpec::input("other", ValueType::Int)).unwrap();
    graph.set_value(other, true.into()).unwrap();
    assert_eq!(graph.value(other, &context).unwrap(), Value::Int(1));
}

#[test]
fn test_cycles() {
    let graph = graph();
    let a = graph.add_node("a", Add::default()).unwrap();
    let b = graph.add_node("b", Add::default()).unwrap();
    let a_in = graph.plug(a, "in1").unwrap();
    let a_in2 = graph.plug(a, "in2").unwrap();
    let a_sum = graph.plug(a, "sum").unwrap();
    let b_in = graph.plug(b, "in1").unwrap();
    let b_sum = graph.plug(b, "sum").unwrap();

    graph.set_input(b_in, Some(a_sum)).unwrap();
    assert!(matches!(graph.set_input(a_in, Some(b_sum)), Err(Error::CycleDetected { .. })));
    assert!(matches!(graph.set_input(a_in2, Some(a_sum)), Err(Error::CycleDetected { .. })));
    assert!(matches!(graph.set_input(a_in, Some(a_in)), Err(Error::CycleDetected { .. })));
    assert_eq!(graph.input(a_in).unwrap(), None);
    assert_eq!(graph.input(a_in2).unwrap(), None);
}

/// Connecting random pairs of nodes either succeeds or fails with a cycle,
/// and a failure changes nothing.
#[quickcheck]
fn prop_rejected_cycles_leave_graph_unchanged(edges: Vec<(u8, u8)>) -> bool {
    const N: usize = 6;
    let graph = graph();
    let nodes: Vec<_> =
        (0..N).map(|i| graph.add_node(&format!("n{i}"), Add::default()).unwrap()).collect();
    let inputs: Vec<_> = nodes.iter().map(|&n| graph.plug(n, "in1").unwrap()).collect();
    let sums: Vec<_> = nodes.iter().map(|&n| graph.plug(n, "sum").unwrap()).collect();
    let snapshot = |graph: &Graph| -> Vec<_> {
        inputs.iter().map(|&p| graph.input(p).unwrap()).collect()
    };

    for (from, to) in edges {
        let (from, to) = (usize::from(from) % N, usize::from(to) % N);
        let before = snapshot(&graph);
        match graph.set_input(inputs[to], Some(sums[from])) {
            Ok(()) => {}
            Err(Error::CycleDetected { .. }) => {
                if snapshot(&graph) != before {
                    return false;
                }
            }
            Err(_) => return false,
        }
    }

    // The graph is still acyclic, so every sum evaluates.
    sums.iter().all(|&sum| graph.value(sum, &Context::new()).is_ok())
}

#[test]
fn test_immutable() {
    let graph = graph();
    let src = graph.add_container("src").unwrap();
    let out = graph.add_plug(src, PlugSpec::output("out", ValueType::Float)).unwrap();
    let locked = graph
        .add_plug(
            src,
            PlugSpec::input("locked", ValueType::Float)
                .flags(PlugFlags::DEFAULT | PlugFlags::READ_ONLY),
        )
        .unwrap();
    let add = graph.add_node("add", Add::default()).unwrap();
    let in1 = graph.plug(add, "in1").unwrap();
    let sum = graph.plug(add, "sum").unwrap();

    assert!(matches!(graph.set_value(locked, 1.0.into()), Err(Error::Immutable { .. })));
    assert!(matches!(graph.set_input(locked, Some(out)), Err(Error::Immutable { .. })));
    assert!(matches!(graph.set_value(sum, 1.0.into()), Err(Error::Immutable { .. })));

    graph.set_input(in1, Some(out)).unwrap();
    assert!(matches!(graph.set_value(in1, 1.0.into()), Err(Error::Immutable { .. })));

    graph.set_flags(locked, PlugFlags::DEFAULT).unwrap();
    graph.set_value(locked, 1.0.into()).unwrap();
}

#[test]
fn test_rejected_inputs() {
    let graph = graph();
    let a = graph.add_node("a", Add::default()).unwrap();
    let b = graph.add_node("b", Add::default()).unwrap();
    let a_sum = graph.plug(a, "sum").unwrap();
    let b_sum = graph.plug(b, "sum").unwrap();
    assert!(matches!(graph.set_input(b_sum, Some(a_sum)), Err(Error::InputRejected { .. })));

    let src = graph.add_container("src").unwrap();
    let ok = graph.add_plug(src, PlugSpec::output("ok", ValueType::Float)).unwrap();
    let bad = graph.add_plug(src, PlugSpec::output("bad", ValueType::Float)).unwrap();
    let picky = graph.add_node("picky", Picky).unwrap();
    let input = graph.plug(picky, "in").unwrap();
    assert!(matches!(graph.set_input(input, Some(bad)), Err(Error::InputRejected { .. })));
    graph.set_input(input, Some(ok)).unwrap();

    let closed = graph
        .add_plug(src, PlugSpec::input("closed", ValueType::Float).flags(PlugFlags::SERIALISABLE))
        .unwrap();
    assert!(matches!(graph.set_input(closed, Some(ok)), Err(Error::InputRejected { .. })));
}

#[test]
fn test_compound_plugs() {
    let rgb = |direction| {
        PlugSpec::compound(
            "color",
            direction,
            ["r", "g", "b"].map(|c| PlugSpec::input(c, ValueType::Float)),
        )
    };
    let graph = graph();
    let src = graph.add_container("src").unwrap();
    let dst = graph.add_container("dst").unwrap();
    let out = graph.add_plug(src, rgb(Direction::Out)).unwrap();
    let input = graph.add_plug(dst, rgb(Direction::In)).unwrap();

    let children = graph.children(out).unwrap();
    assert_eq!(children.len(), 3);
    assert_eq!(graph.direction(children[0]).unwrap(), Direction::Out);
    assert_eq!(graph.full_name(children[1]), "src.color.g");
    assert_eq!(graph.find_plug("src.color.g").unwrap(), children[1]);
    assert_eq!(graph.parent(children[1]).unwrap(), Some(out));

    graph.set_value(children[0], 0.25.into()).unwrap();
    graph.set_input(input, Some(out)).unwrap();
    let dst_children = graph.children(input).unwrap();
    for (child, source) in dst_children.iter().zip(&children) {
        assert_eq!(graph.input(*child).unwrap(), Some(*source));
    }

    let context = Context::new();
    assert_eq!(
        graph.value(input, &context).unwrap(),
        Value::from(vec![Value::Float(0.25), Value::Float(0.0), Value::Float(0.0)])
    );
    assert_eq!(graph.hash(input, &context).unwrap(), graph.hash(out, &context).unwrap());
    assert!(matches!(graph.set_value(input, 1.0.into()), Err(Error::Immutable { .. })));

    graph.set_input(input, None).unwrap();
    assert!(dst_children.iter().all(|&child| graph.input(child).unwrap().is_none()));

    // A source with fewer children doesn't fit.
    let pair = graph
        .add_plug(
            src,
            PlugSpec::compound(
                "pair",
                Direction::Out,
                ["x", "y"].map(|c| PlugSpec::output(c, ValueType::Float)),
            ),
        )
        .unwrap();
    assert!(matches!(graph.set_input(input, Some(pair)), Err(Error::TypeMismatch { .. })));
}

#[test]
fn test_defaults() {
    let graph = graph();
    let node = graph.add_container("node").unwrap();
    let speed = graph
        .add_plug(node, PlugSpec::input("speed", ValueType::Float).default(1.0))
        .unwrap();
    assert_eq!(graph.default_value(speed).unwrap(), Value::Float(1.0));
    assert!(graph.is_set_to_default(speed).unwrap());
    assert!(graph.flags(speed).unwrap().contains(PlugFlags::DYNAMIC));

    graph.set_value(speed, 2.0.into()).unwrap();
    assert!(!graph.is_set_to_default(speed).unwrap());
    graph.set_to_default(speed).unwrap();
    assert!(graph.is_set_to_default(speed).unwrap());
    assert_eq!(graph.value(speed, &Context::new()).unwrap(), Value::Float(1.0));

    let add = graph.add_node("add", Add::default()).unwrap();
    assert!(!graph.is_set_to_default(graph.plug(add, "sum").unwrap()).unwrap());

    assert!(matches!(
        graph.add_plug(node, PlugSpec::input("bad", ValueType::Int).default("text")),
        Err(Error::TypeMismatch { .. })
    ));
}

#[test]
fn test_names() {
    let graph = graph();
    let add = graph.add_node("add", Add::default()).unwrap();
    assert_eq!(graph.node("add"), Some(add));
    assert_eq!(graph.node_name(add).unwrap(), "add");
    assert_eq!(graph.node_type(add).unwrap(), "Add");
    assert_eq!(graph.nodes(), vec![add]);

    let in1 = graph.find_plug("add.in1").unwrap();
    assert_eq!(graph.name(in1).unwrap(), "in1");
    assert_eq!(graph.full_name(in1), "add.in1");
    assert_eq!(graph.node_of(in1).unwrap(), add);
    assert_eq!(graph.plugs(add).unwrap().len(), 3);

    assert!(matches!(graph.add_node("add", Add::default()), Err(Error::DuplicateName { .. })));
    assert!(graph.add_node("a.b", Add::default()).is_err());
    assert!(graph.add_node("", Add::default()).is_err());
    assert!(matches!(
        graph.add_plug(add, PlugSpec::input("in1", ValueType::Float)),
        Err(Error::DuplicateName { .. })
    ));
    assert!(graph.find_plug("add.missing").is_err());
}

#[test]
fn test_remove_node() {
    let graph = graph();
    let a = graph.add_node("a", Add::new(1.0)).unwrap();
    let b = graph.add_node("b", Add::new(2.0)).unwrap();
    let a_sum = graph.plug(a, "sum").unwrap();
    let b_in = graph.plug(b, "in1").unwrap();
    let b_sum = graph.plug(b, "sum").unwrap();
    graph.set_input(b_in, Some(a_sum)).unwrap();

    let context = Context::new();
    assert_eq!(graph.value(b_sum, &context).unwrap(), Value::Float(3.0));

    graph.remove_node(a).unwrap();
    assert!(!graph.contains(a_sum));
    assert_eq!(graph.input(b_in).unwrap(), None);
    assert!(matches!(graph.value(a_sum, &context), Err(Error::InvalidPlug(_))));
    assert!(matches!(graph.remove_node(a), Err(Error::InvalidNode(_))));
    assert_eq!(graph.value(b_sum, &context).unwrap(), Value::Float(2.0));

    // Identities are never reused.
    let c = graph.add_node("a", Add::new(1.0)).unwrap();
    assert_ne!(graph.plug(c, "sum").unwrap(), a_sum);
    assert!(!graph.contains(a_sum));
}

#[test]
fn test_remove_plug() {
    let graph = graph();
    let node = graph.add_container("node").unwrap();
    let out = graph.add_plug(node, PlugSpec::output("out", ValueType::Float)).unwrap();
    let add = graph.add_node("add", Add::default()).unwrap();
    let in1 = graph.plug(add, "in1").unwrap();
    graph.set_input(in1, Some(out)).unwrap();

    graph.remove_plug(out).unwrap();
    assert!(!graph.contains(out));
    assert_eq!(graph.input(in1).unwrap(), None);
    assert!(graph.plug(node, "out").is_err());
}
