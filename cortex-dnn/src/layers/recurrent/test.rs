use std::error::Error;

use cortex_core::{Blob, BlobDesc, BlobDim};

use crate::{
    layer::Layer,
    layers::{BackLink, EltwiseSum},
    utils::{are_similar, backward, blob, forward, row},
};

use super::Recurrent;

/// Running sum: `s[t] = s[t - 1] + x[t]`.
fn accumulator() -> Result<Recurrent, Box<dyn Error>> {
    let mut layer = Recurrent::new();
    layer.add_layer("Previous", BackLink::new(1))?;
    layer.add_layer("Sum", EltwiseSum::new())?;
    layer.graph_mut().connect("Sum", 1, "Previous", 0)?;
    layer.graph_mut().connect_feedback("Previous", "Sum", 0)?;
    layer.set_input_mapping(0, "Sum", 0)?;
    layer.set_input_mapping(1, "Previous", 0)?;
    layer.set_output_mapping(0, "Sum", 0)?;
    Ok(layer)
}

fn sequence(values: &[f32]) -> Blob {
    blob(
        BlobDesc::channels_only(1).with(BlobDim::BatchLength, values.len()),
        values,
    )
}

mod forward {
    use super::*;

    #[test]
    fn arity() -> Result<(), Box<dyn Error>> {
        let layer = accumulator()?;
        assert_eq!(layer.input_count(), 1..=2);
        Ok(())
    }

    #[test]
    fn zero_initial_state() -> Result<(), Box<dyn Error>> {
        let input = sequence(&[1., 2., 3.]);
        let mut layer = accumulator()?;
        let pass = forward(&mut layer, &[&input], false)?;

        assert_eq!(layer.sequence_length(), 3);
        are_similar(&pass.outputs[0], &sequence(&[1., 3., 6.]))
    }

    #[test]
    fn given_initial_state() -> Result<(), Box<dyn Error>> {
        let input = sequence(&[1., 2., 3.]);
        let state = row(&[10.]);
        let pass = forward(&mut accumulator()?, &[&input, &state], false)?;

        are_similar(&pass.outputs[0], &sequence(&[11., 13., 16.]))
    }

    #[test]
    fn reverse_sequence() -> Result<(), Box<dyn Error>> {
        let input = sequence(&[1., 2., 3.]);
        let mut layer = accumulator()?;
        layer.set_reverse_sequence(true);
        let pass = forward(&mut layer, &[&input], false)?;

        are_similar(&pass.outputs[0], &sequence(&[6., 5., 3.]))
    }

    #[test]
    fn rejects_long_initial_state() -> Result<(), Box<dyn Error>> {
        let mut layer = accumulator()?;
        let desc = BlobDesc::channels_only(1).with(BlobDim::BatchLength, 3);
        assert!(layer
            .reshape(&[desc, desc.with(BlobDim::BatchLength, 2)])
            .is_err());
        Ok(())
    }

    #[test]
    fn needs_output_mapping() {
        let mut layer = Recurrent::new();
        layer.add_layer("Sum", EltwiseSum::new()).unwrap();
        layer.set_input_mapping(0, "Sum", 0).unwrap();
        layer.set_input_mapping(1, "Sum", 1).unwrap();

        let desc = BlobDesc::channels_only(1);
        assert!(layer.reshape(&[desc, desc]).is_err());
        assert!(layer.set_output_mapping(0, "Missing", 0).is_err());
    }

    #[test]
    fn round_trip() -> Result<(), Box<dyn Error>> {
        let layer = accumulator()?;
        let registry = crate::LayerRegistry::default();
        let mut restored = Recurrent::load(layer.version(), layer.save()?, &registry)?;

        let input = sequence(&[1., 2., 3.]);
        let pass = forward(&mut *restored, &[&input], false)?;
        are_similar(&pass.outputs[0], &sequence(&[1., 3., 6.]))
    }
}

mod backward {
    use super::*;

    #[test]
    fn through_time() -> Result<(), Box<dyn Error>> {
        let input = sequence(&[1., 2., 3.]);
        let state = row(&[10.]);
        let mut layer = accumulator()?;
        let pass = forward(&mut layer, &[&input, &state], true)?;
        let diffs = backward(&mut layer, &[&input, &state], &pass, &[sequence(&[1., 1., 1.])])?;

        // Every output depends on the inputs of its step and of the steps
        // before it.
        are_similar(&diffs[0], &sequence(&[3., 2., 1.]))?;
        are_similar(&diffs[1], &row(&[3.]))
    }

    #[test]
    fn through_reversed_time() -> Result<(), Box<dyn Error>> {
        let input = sequence(&[1., 2., 3.]);
        let mut layer = accumulator()?;
        layer.set_reverse_sequence(true);
        let pass = forward(&mut layer, &[&input], true)?;
        let diffs = backward(&mut layer, &[&input], &pass, &[sequence(&[1., 0., 0.])])?;

        are_similar(&diffs[0], &sequence(&[1., 1., 1.]))
    }
}
