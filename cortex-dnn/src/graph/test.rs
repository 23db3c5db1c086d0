use std::error::Error;

use cortex_core::{ActivationKind, CpuMathEngine};

use crate::{
    layers::{Activation, BackLink, EltwiseSum, FullyConnected, Sink, Source},
    registry::LayerRegistry,
    solver::SimpleGradientSolver,
    utils::{are_similar, row},
};

use super::Graph;

fn source(values: &[f32]) -> Source {
    Source::with_blob(row(values))
}

mod structure {
    use super::*;

    #[test]
    fn insertion_order_breaks_ties() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        graph.add_layer("d", source(&[1.]))?;
        graph.add_layer("sum", EltwiseSum::new())?;
        graph.add_layer("a", source(&[1.]))?;
        graph.add_layer("c", source(&[1.]))?;
        graph.connect("sum", 0, "c", 0)?;
        graph.connect("sum", 1, "a", 0)?;

        assert_eq!(graph.execution_order()?, vec!["d", "a", "c", "sum"]);
        assert_eq!(graph.layer_names(), vec!["d", "sum", "a", "c"]);
        Ok(())
    }

    #[test]
    fn cycle_without_feedback() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        graph.add_layer("a", Activation::new(ActivationKind::Relu))?;
        graph.add_layer("b", Activation::new(ActivationKind::Relu))?;
        graph.connect("a", 0, "b", 0)?;
        graph.connect("b", 0, "a", 0)?;

        assert!(matches!(graph.reshape(), Err(cortex_core::Error::Architecture { .. })));
        assert!(graph.is_dirty());
        Ok(())
    }

    #[test]
    fn duplicate_name() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        graph.add_layer("a", Sink::new())?;
        assert!(matches!(
            graph.add_layer("a", Sink::new()),
            Err(cortex_core::Error::DuplicateName(name)) if name == "a"
        ));
        assert_eq!(graph.len(), 1);
        Ok(())
    }

    #[test]
    fn connect_checks_arity() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        graph.add_layer("in", source(&[1.]))?;
        graph.add_layer("out", Sink::new())?;

        assert!(graph.connect("out", 1, "in", 0).is_err());
        assert!(graph.connect("out", 0, "missing", 0).is_err());
        Ok(())
    }

    #[test]
    fn missing_output_index() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        graph.add_layer("in", source(&[1.]))?;
        graph.add_layer("out", Sink::new())?;
        graph.connect("out", 0, "in", 3)?;

        assert!(matches!(
            graph.reshape(),
            Err(cortex_core::Error::Architecture { layer, .. }) if layer == "out"
        ));
        Ok(())
    }

    #[test]
    fn reshape_is_idempotent() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        graph.add_layer("in", source(&[-1., 2.]))?;
        graph.add_layer("relu", Activation::new(ActivationKind::Relu))?;
        graph.connect("relu", 0, "in", 0)?;
        graph.run_once()?;
        let first = graph.output("relu", 0)?.data().as_ptr();

        graph.reshape()?;
        assert!(!graph.is_dirty());
        graph.force_reshape()?;
        graph.run_once()?;
        assert_eq!(graph.output("relu", 0)?.data().as_ptr(), first);
        are_similar(graph.output("relu", 0)?, &row(&[0., 2.]))
    }

    #[test]
    fn changes_mark_dirty() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        graph.add_layer("in", source(&[1.]))?;
        graph.reshape()?;

        graph.set_source_blob("in", row(&[2.]))?;
        assert!(graph.is_dirty());
        graph.reshape()?;
        graph.layer_mut::<Source>("in")?;
        assert!(graph.is_dirty());
        Ok(())
    }

    #[test]
    fn rebinding_external_of_same_shape() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        graph.add_layer("relu", Activation::new(ActivationKind::Relu))?;
        graph.connect_external("relu", 0, 0)?;
        graph.set_external(0, row(&[1., -1.]));
        graph.run_once()?;

        graph.set_external(0, row(&[-3., 3.]));
        assert!(!graph.is_dirty());
        graph.set_external(0, row(&[1.]));
        assert!(graph.is_dirty());
        Ok(())
    }

    #[test]
    fn delete_disconnects() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        graph.add_layer("in", source(&[1.]))?;
        graph.add_layer("out", Sink::new())?;
        graph.connect("out", 0, "in", 0)?;
        graph.reshape()?;

        graph.delete_layer("in")?;
        assert!(graph.is_dirty());
        assert!(!graph.has_layer("in"));
        assert!(graph.reshape().is_err());
        Ok(())
    }

    #[test]
    fn typed_access() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        graph.add_layer("in", source(&[1.]))?;
        assert!(graph.layer::<Source>("in").is_ok());
        assert!(graph.layer::<Sink>("in").is_err());
        assert!(graph.layer::<Source>("missing").is_err());
        Ok(())
    }
}

mod forward {
    use super::*;

    #[test]
    fn outputs_before_run() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        graph.add_layer("in", source(&[1.]))?;
        assert!(graph.output("in", 0).is_err());
        graph.run_once()?;
        are_similar(graph.output("in", 0)?, &row(&[1.]))
    }

    #[test]
    fn feedback_delivers_previous_step() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        graph.add_layer("init", source(&[10.]))?;
        graph.add_layer("x", source(&[1.]))?;
        graph.add_layer("previous", BackLink::new(1))?;
        graph.add_layer("sum", EltwiseSum::new())?;
        graph.connect("previous", 0, "init", 0)?;
        graph.connect("sum", 0, "x", 0)?;
        graph.connect("sum", 1, "previous", 0)?;
        graph.connect_feedback("previous", "sum", 0)?;

        graph.begin_sequence();
        graph.forward_step(&CpuMathEngine, false)?;
        are_similar(graph.output("sum", 0)?, &row(&[11.]))?;
        graph.forward_step(&CpuMathEngine, false)?;
        are_similar(graph.output("sum", 0)?, &row(&[12.]))?;

        // A new sequence starts from the initial state again.
        graph.run_once()?;
        are_similar(graph.output("sum", 0)?, &row(&[11.]))
    }

    #[test]
    fn feedback_needs_holder() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        graph.add_layer("x", source(&[1.]))?;
        graph.add_layer("relu", Activation::new(ActivationKind::Relu))?;
        assert!(graph.connect_feedback("relu", "x", 0).is_err());
        Ok(())
    }
}

mod backward {
    use super::*;

    fn linear() -> Result<Graph, Box<dyn Error>> {
        let mut fc = FullyConnected::new(1)?;
        fc.set_weights(Some(row(&[1., 1.])))?;

        let mut graph = Graph::new();
        graph.add_layer("x", source(&[1., 2.]))?;
        graph.add_layer("fc", fc)?;
        graph.add_layer("out", Sink::new())?;
        graph.add_layer("y", source(&[-1.]))?;
        graph.add_layer("relu", Activation::new(ActivationKind::Relu))?;
        graph.add_layer("ignored", Sink::new())?;
        graph.connect("fc", 0, "x", 0)?;
        graph.connect("out", 0, "fc", 0)?;
        graph.connect("relu", 0, "y", 0)?;
        graph.connect("ignored", 0, "relu", 0)?;
        Ok(graph)
    }

    #[test]
    fn needs_training_forward() -> Result<(), Box<dyn Error>> {
        let mut graph = linear()?;
        assert!(matches!(graph.run_backward_once(), Err(cortex_core::Error::State(_))));

        graph.run_once()?;
        assert!(matches!(graph.run_backward_once(), Err(cortex_core::Error::State(_))));

        graph.set_training(true);
        graph.run_once()?;
        graph.run_backward_once()?;

        graph.add_layer("late", Sink::new())?;
        assert!(matches!(graph.run_backward_once(), Err(cortex_core::Error::State(_))));
        Ok(())
    }

    #[test]
    fn skips_branches_without_gradients() -> Result<(), Box<dyn Error>> {
        let mut graph = linear()?;
        graph.reshape()?;
        graph.set_sink_diff("out", Some(row(&[1.])))?;
        graph.run_and_backward_once()?;

        are_similar(graph.output_diff("fc", 0)?, &row(&[1.]))?;
        assert!(graph.output_diff("relu", 0).is_err());

        let fc = graph.layer::<FullyConnected>("fc")?;
        are_similar(fc.weights_diff().unwrap(), &row(&[1., 2.]))
    }

    #[test]
    fn seeded_gradient() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        let mut a = source(&[1., 2.]);
        a.set_collect_diff(true);
        graph.add_layer("a", a)?;
        graph.add_layer("b", source(&[3., 4.]))?;
        graph.add_layer("sum", EltwiseSum::new())?;
        graph.connect("sum", 0, "a", 0)?;
        graph.connect("sum", 1, "b", 0)?;
        graph.reshape()?;
        graph.set_output_diff("sum", 0, row(&[0.5, -1.]))?;
        assert!(graph.set_output_diff("sum", 0, row(&[1.])).is_err());

        graph.run_and_backward_once()?;
        are_similar(graph.output_diff("a", 0)?, &row(&[0.5, -1.]))
    }

    #[test]
    fn solver_step_and_frozen_layers() -> Result<(), Box<dyn Error>> {
        let mut solver = SimpleGradientSolver::new(0.5);
        let mut graph = linear()?;
        graph.reshape()?;
        graph.set_sink_diff("out", Some(row(&[1.])))?;
        graph.run_and_learn_once(&mut solver)?;
        are_similar(
            graph.layer::<FullyConnected>("fc")?.weights().unwrap(),
            &row(&[0.5, 0.]),
        )?;

        graph.set_layer_learning("fc", false)?;
        graph.reshape()?;
        graph.set_sink_diff("out", Some(row(&[1.])))?;
        graph.run_and_learn_once(&mut solver)?;
        are_similar(
            graph.layer::<FullyConnected>("fc")?.weights().unwrap(),
            &row(&[0.5, 0.]),
        )
    }

    #[test]
    fn round_trip() -> Result<(), Box<dyn Error>> {
        let mut graph = linear()?;
        graph.run_once()?;
        let json = graph.save()?;

        let mut restored = Graph::load(&json, &LayerRegistry::default())?;
        assert_eq!(restored.layer_names(), graph.layer_names());
        // Source blobs are data, not part of the archive.
        assert!(restored.run_once().is_err());
        restored.set_source_blob("x", row(&[1., 2.]))?;
        restored.set_source_blob("y", row(&[-1.]))?;
        restored.run_once()?;
        are_similar(restored.sink_blob("out")?, graph.sink_blob("out")?)
    }

    #[test]
    fn rejects_old_archives() {
        let json = r#"{ "version": 999, "layers": [] }"#;
        assert!(matches!(
            Graph::load(json, &LayerRegistry::default()),
            Err(cortex_core::Error::UnsupportedVersion { version: 999, .. })
        ));
    }

    #[test]
    fn reads_blob_gradient_of_externals() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        graph.add_layer("relu", Activation::new(ActivationKind::Relu))?;
        graph.add_layer("out", Sink::new())?;
        graph.connect_external("relu", 0, 0)?;
        graph.connect("out", 0, "relu", 0)?;
        graph.set_external(0, row(&[-1., 2.]));
        graph.set_external_requires_diff(0, true);
        graph.reshape()?;
        graph.set_sink_diff("out", Some(row(&[1., 1.])))?;

        graph.run_and_backward_once()?;
        are_similar(graph.external_diff(0).unwrap(), &row(&[0., 1.]))
    }
}
