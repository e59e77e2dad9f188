use std::sync::Arc;
use std::thread;

use plexus::monitor::{
    ContextMonitor, PerformanceMetric, PerformanceMonitor, ThreadMonitor, format_metric,
    format_statistics,
};
use plexus::nodes::{Add, Frame};
use plexus::{Context, Engine, EngineConfig, FRAME, FRAMES_PER_SECOND, Graph, ProcessKind};

fn graph() -> Graph {
    Graph::with_engine(Arc::new(Engine::new(EngineConfig::default())))
}

/// Two chained additions with static inputs.
fn chain(graph: &Graph) -> (plexus::PlugId, plexus::PlugId) {
    let a = graph.add_node("a", Add::new(1.0)).unwrap();
    let b = graph.add_node("b", Add::new(2.0)).unwrap();
    let a_sum = graph.plug(a, "sum").unwrap();
    graph.set_input(graph.plug(b, "in1").unwrap(), Some(a_sum)).unwrap();
    (a_sum, graph.plug(b, "sum").unwrap())
}

#[test]
fn test_performance_counts() {
    let graph = graph();
    let (a_sum, b_sum) = chain(&graph);
    let monitor = Arc::new(PerformanceMonitor::new());
    let _scope = graph.engine().attach(monitor.clone());

    let context = Context::new();
    assert_eq!(graph.value(b_sum, &context).unwrap().as_float(), Some(3.0));
    assert_eq!(graph.value(b_sum, &context).unwrap().as_float(), Some(3.0));

    for plug in [a_sum, b_sum] {
        let s = monitor.plug_statistics(plug);
        assert_eq!((s.hash_count, s.compute_count), (1, 1), "{}", graph.full_name(plug));
    }
    let combined = monitor.combined_statistics();
    assert_eq!((combined.hash_count, combined.compute_count), (2, 2));
    assert_eq!(monitor.all_statistics().len(), 2);

    monitor.clear();
    assert_eq!(monitor.combined_statistics().compute_count, 0);
}

#[test]
fn test_detach() {
    let graph = graph();
    let (_, b_sum) = chain(&graph);
    let monitor = Arc::new(PerformanceMonitor::new());

    let scope = graph.engine().attach(monitor.clone());
    drop(scope);
    graph.value(b_sum, &Context::new()).unwrap();
    assert_eq!(monitor.combined_statistics().hash_count, 0);

    let _scope = graph.engine().attach(monitor.clone());
    assert!(graph.engine().detach(&*monitor));
    assert!(!graph.engine().detach(&*monitor));
}

#[test]
fn test_monitors_are_per_engine() {
    let one = graph();
    let two = graph();
    let (_, sum_one) = chain(&one);
    let (_, sum_two) = chain(&two);
    let monitor = Arc::new(PerformanceMonitor::new());
    let _scope = one.engine().attach(monitor.clone());

    two.value(sum_two, &Context::new()).unwrap();
    assert_eq!(monitor.combined_statistics().compute_count, 0);
    one.value(sum_one, &Context::new()).unwrap();
    assert_eq!(monitor.combined_statistics().compute_count, 2);
}

#[test]
fn test_context_monitor() {
    let graph = graph();
    let frame = graph.add_node("frame", Frame).unwrap();
    let out = graph.plug(frame, "out").unwrap();
    let add = graph.add_node("add", Add::default()).unwrap();
    graph.set_input(graph.plug(add, "in1").unwrap(), Some(out)).unwrap();
    let sum = graph.plug(add, "sum").unwrap();

    let all = Arc::new(ContextMonitor::new());
    let filtered = Arc::new(ContextMonitor::for_nodes([frame]));
    let _all = graph.engine().attach(all.clone());
    let _filtered = graph.engine().attach(filtered.clone());

    let mut context = Context::new();
    for f in 1..=3 {
        context.set_frame(f64::from(f));
        graph.value(sum, &context).unwrap();
    }

    let s = all.plug_statistics(out);
    assert_eq!(s.num_unique_contexts(), 3);
    assert_eq!(s.num_unique_values(FRAME), 3);
    assert_eq!(s.num_unique_values(FRAMES_PER_SECOND), 1);
    assert_eq!(s.num_unique_values("missing"), 0);
    assert_eq!(s.variable_names().len(), 2);
    assert_eq!(all.plug_statistics(sum).num_unique_contexts(), 3);
    assert_eq!(all.combined_statistics().num_unique_contexts(), 3);

    assert_eq!(filtered.plug_statistics(out).num_unique_contexts(), 3);
    assert_eq!(filtered.plug_statistics(sum).num_unique_contexts(), 0);
    assert_eq!(filtered.all_statistics().len(), 1);
}

#[test]
fn test_thread_monitor() {
    let graph = graph();
    let (a_sum, b_sum) = chain(&graph);
    let computes = Arc::new(ThreadMonitor::new());
    let everything = Arc::new(ThreadMonitor::with_kinds([ProcessKind::Hash, ProcessKind::Compute]));
    let _computes = graph.engine().attach(computes.clone());
    let _everything = graph.engine().attach(everything.clone());

    graph.value(b_sum, &Context::new()).unwrap();

    let me = thread::current().id();
    assert_eq!(computes.plug_statistics(a_sum).get(&me), Some(&1));
    assert_eq!(computes.combined_statistics().get(&me), Some(&2));
    assert_eq!(everything.combined_statistics().get(&me), Some(&4));
    assert_eq!(everything.all_statistics().len(), 2);
}

#[test]
fn test_format_statistics() {
    let graph = graph();
    let (_, b_sum) = chain(&graph);
    let monitor = Arc::new(PerformanceMonitor::new());
    let _scope = graph.engine().attach(monitor.clone());
    graph.value(b_sum, &Context::new()).unwrap();

    let report = format_statistics(&monitor, &graph, 10);
    assert!(report.starts_with("PerformanceMonitor Summary :\n\n"), "{report}");
    assert!(report.contains("Total number of compute processes"), "{report}");
    assert!(report.contains("Top 2 plugs by number of compute processes :"), "{report}");
    assert!(report.contains("a.sum") && report.contains("b.sum"), "{report}");

    let top = format_metric(&monitor, &graph, PerformanceMetric::ComputeCount, 1);
    assert!(top.starts_with("Top 1 plugs by number of compute processes :"), "{top}");

    monitor.clear();
    assert!(format_metric(&monitor, &graph, PerformanceMetric::HashCount, 10).is_empty());
}
