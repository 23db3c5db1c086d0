use std::error::Error;

use cortex_core::{BlobDesc, BlobDim};

use crate::{
    layer::Layer,
    utils::{are_similar, backward, blob, forward, learn, row},
};

use super::{weights_desc, FullyConnected};

fn layer() -> Result<FullyConnected, Box<dyn Error>> {
    let mut layer = FullyConnected::new(2)?;
    layer.set_weights(Some(blob(weights_desc(2, 3), &[1., 0., -1., 0.5, 0.5, 0.5])))?;
    layer.set_free_term(Some(row(&[0.1, -0.1])))?;
    Ok(layer)
}

fn batch() -> cortex_core::Blob {
    blob(
        BlobDesc::channels_only(3).with(BlobDim::BatchWidth, 2),
        &[1., 2., 3., -1., 0., 1.],
    )
}

mod forward {
    use super::*;

    #[test]
    fn creation() {
        assert!(FullyConnected::new(0).is_err());
        let mut layer = FullyConnected::new(2).unwrap();
        assert!(layer.set_weights(Some(row(&[1., 2.]))).is_err());
        assert!(layer.set_free_term(Some(row(&[1.]))).is_err());
    }

    #[test]
    fn empty_objects() {
        let mut layer = FullyConnected::new(2).unwrap();
        assert!(matches!(
            layer.reshape(&[BlobDesc::channels_only(0)]),
            Err(cortex_core::Error::Architecture { .. })
        ));
        assert!(layer.weights().is_none());
    }

    #[test]
    fn affine_map() -> Result<(), Box<dyn Error>> {
        let input = batch();
        let pass = forward(&mut layer()?, &[&input], false)?;

        are_similar(
            &pass.outputs[0],
            &blob(
                BlobDesc::channels_only(2).with(BlobDim::BatchWidth, 2),
                &[-1.9, 2.9, -1.9, -0.1],
            ),
        )
    }

    #[test]
    fn initializes_weights() -> Result<(), Box<dyn Error>> {
        let mut layer = FullyConnected::new(4)?.with_seed(3);
        let outputs = layer.reshape(&[BlobDesc::channels_only(2).with(BlobDim::Height, 8)])?;
        assert_eq!(outputs[0], BlobDesc::channels_only(4));

        let weights = layer.weights().unwrap();
        assert_eq!(weights.desc(), weights_desc(4, 16));
        assert!(weights.data().iter().all(|w| w.abs() <= 0.25));
        assert!(layer.free_term().unwrap().data().iter().all(|&b| b == 0.));
        Ok(())
    }

    #[test]
    fn rejects_incompatible_weights() -> Result<(), Box<dyn Error>> {
        let mut layer = layer()?;
        assert!(layer.reshape(&[BlobDesc::channels_only(4)]).is_err());
        Ok(())
    }
}

mod backward {
    use super::*;

    #[test]
    fn input_gradient() -> Result<(), Box<dyn Error>> {
        let input = batch();
        let mut layer = layer()?;
        let pass = forward(&mut layer, &[&input], true)?;
        let gradient = blob(
            BlobDesc::channels_only(2).with(BlobDim::BatchWidth, 2),
            &[1., 2., 0., -2.],
        );
        let diffs = backward(&mut layer, &[&input], &pass, &[gradient])?;

        are_similar(&diffs[0], &blob(input.desc(), &[2., 1., 0., -1., -1., -1.]))
    }

    #[test]
    fn parameter_gradients() -> Result<(), Box<dyn Error>> {
        let input = batch();
        let mut layer = layer()?;
        let pass = forward(&mut layer, &[&input], true)?;
        let gradient = blob(
            BlobDesc::channels_only(2).with(BlobDim::BatchWidth, 2),
            &[1., 2., 0., -2.],
        );
        learn(&mut layer, &[&input], &pass, &[gradient.clone()])?;
        learn(&mut layer, &[&input], &pass, &[gradient])?;

        // Gradients accumulate until a solver consumes them.
        are_similar(
            layer.weights_diff().unwrap(),
            &blob(weights_desc(2, 3), &[2., 4., 6., 8., 8., 8.]),
        )?;
        are_similar(layer.free_term_diff().unwrap(), &row(&[2., 0.]))?;
        assert_eq!(layer.parameters().len(), 2);
        Ok(())
    }
}
