use std::error::Error;

use cortex_core::{ActivationKind, Blob, BlobDesc, BlobDim};
use serde_json::json;

use crate::{
    layer::Layer,
    layers::{Dropout, FullyConnected},
    utils::{are_similar, backward, blob, forward, row},
    LayerRegistry,
};

use super::{Lstm, INPUT_DROPOUT, RECUR_DROPOUT, RECUR_HIDDEN};

fn projection(values: &[f32]) -> Blob {
    blob(
        BlobDesc::channels_only(values.len() / 4).with(BlobDim::BatchWidth, 4),
        values,
    )
}

/// One hidden unit over scalar data, rows ordered main, forget, input,
/// reset.
fn lstm() -> Result<Lstm, Box<dyn Error>> {
    let mut lstm = Lstm::new(1)?;
    lstm.set_input_weights(Some(projection(&[0.5, 1., -1., 2.])))?;
    lstm.set_recur_weights(Some(projection(&[0.3, -0.2, 0.4, 0.1])))?;
    Ok(lstm)
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
    fn creation() {
        assert!(Lstm::new(0).is_err());
        let mut lstm = Lstm::new(2).unwrap();
        assert!(lstm.set_dropout_rate(1.).is_err());
        assert!(lstm.set_hidden_size(0).is_err());
        assert_eq!(lstm.recurrent_activation(), ActivationKind::Sigmoid);
        assert_eq!(lstm.input_count(), 1..=3);
    }

    #[test]
    fn two_steps() -> Result<(), Box<dyn Error>> {
        let input = sequence(&[1., -2.]);
        let pass = forward(&mut lstm()?, &[&input], false)?;

        are_similar(&pass.outputs[0], &sequence(&[0.108_907_46, -0.010_359_013]))?;
        are_similar(&pass.outputs[1], &sequence(&[0.124_282_45, -0.647_25]))
    }

    #[test]
    fn given_initial_state_matches_continuation() -> Result<(), Box<dyn Error>> {
        let mut lstm = lstm()?;
        let first = forward(&mut lstm, &[&sequence(&[1.])], false)?;
        let state = row(&first.outputs[1].to_vec());
        let output = row(&first.outputs[0].to_vec());
        let second = forward(&mut lstm, &[&sequence(&[-2.]), &state, &output], false)?;

        are_similar(&second.outputs[0], &sequence(&[-0.010_359_013]))
    }

    #[test]
    fn compatibility_mode() -> Result<(), Box<dyn Error>> {
        let input = sequence(&[1., -2.]);
        let mut lstm = lstm()?;
        lstm.set_compatibility_mode(true)?;
        let pass = forward(&mut lstm, &[&input], false)?;

        are_similar(&pass.outputs[0], &sequence(&[0.123_646_48, -0.569_815_75]))
    }

    #[test]
    fn dropout_rebuilds_only_when_switched() -> Result<(), Box<dyn Error>> {
        let mut lstm = lstm()?;
        assert!(!lstm.cell().graph().has_layer(INPUT_DROPOUT));

        lstm.set_dropout_rate(0.25)?;
        assert!(lstm.cell().graph().has_layer(RECUR_DROPOUT));
        lstm.set_dropout_rate(0.5)?;
        let graph = lstm.cell().graph();
        assert_eq!(graph.layer::<Dropout>(INPUT_DROPOUT)?.rate(), 0.5);
        assert_eq!(graph.layer::<Dropout>(RECUR_DROPOUT)?.rate(), 0.5);

        lstm.set_dropout_rate(0.)?;
        assert!(!lstm.cell().graph().has_layer(INPUT_DROPOUT));
        // Weights survive the rebuilds.
        are_similar(lstm.input_weights().unwrap(), &projection(&[0.5, 1., -1., 2.]))
    }

    #[test]
    fn activation_keeps_weights() -> Result<(), Box<dyn Error>> {
        let mut lstm = lstm()?;
        lstm.set_recurrent_activation(ActivationKind::HardSigmoid)?;
        are_similar(lstm.recur_weights().unwrap(), &projection(&[0.3, -0.2, 0.4, 0.1]))?;

        lstm.set_hidden_size(3)?;
        assert!(lstm.recur_weights().is_none());
        assert_eq!(lstm.recurrent_activation(), ActivationKind::HardSigmoid);
        Ok(())
    }

    #[test]
    fn shape_checks() -> Result<(), Box<dyn Error>> {
        let mut lstm = Lstm::new(2)?;
        let data = BlobDesc::channels_only(3)
            .with(BlobDim::BatchLength, 4)
            .with(BlobDim::BatchWidth, 2);
        let state = BlobDesc::channels_only(2).with(BlobDim::BatchWidth, 2);

        assert!(lstm.reshape(&[data.with(BlobDim::ListSize, 2)]).is_err());
        assert!(lstm.reshape(&[data, BlobDesc::channels_only(2)]).is_err());
        assert!(lstm.reshape(&[data, state.with(BlobDim::Channels, 3)]).is_err());
        assert!(lstm.reshape(&[data, state.with(BlobDim::BatchLength, 2)]).is_err());

        let outputs = lstm.reshape(&[data, state, state])?;
        let expected = BlobDesc::channels_only(2)
            .with(BlobDim::BatchLength, 4)
            .with(BlobDim::BatchWidth, 2);
        assert_eq!(outputs, vec![expected, expected]);
        Ok(())
    }

    #[test]
    fn legacy_record() -> Result<(), Box<dyn Error>> {
        let combined = blob(
            BlobDesc::channels_only(2).with(BlobDim::BatchWidth, 4),
            &[0.5, 0.3, 1., -0.2, -1., 0.4, 2., 0.1],
        );
        let body = json!({
            "hidden_size": 1,
            "recurrent_activation": ActivationKind::Sigmoid,
            "weights": combined,
            "free_term": row(&[0., 0., 0., 0.]),
        });
        let mut legacy = Lstm::load(1000, body, &LayerRegistry::default())?;

        let input = sequence(&[1., -2.]);
        let restored = forward(&mut *legacy, &[&input], false)?;
        let expected = forward(&mut lstm()?, &[&input], false)?;
        are_similar(&restored.outputs[0], &expected.outputs[0])
    }

    #[test]
    fn unsupported_version() {
        let registry = LayerRegistry::default();
        assert!(Lstm::load(999, json!({}), &registry).is_err());
        assert!(Lstm::load(2002, json!({}), &registry).is_err());
    }

    #[test]
    fn round_trip() -> Result<(), Box<dyn Error>> {
        let mut lstm = lstm()?;
        lstm.set_reverse_sequence(true);
        let body = lstm.save()?;
        let mut restored = Lstm::load(lstm.version(), body, &LayerRegistry::default())?;

        let input = sequence(&[1., -2.]);
        let expected = forward(&mut lstm, &[&input], false)?;
        let pass = forward(&mut *restored, &[&input], false)?;
        are_similar(&pass.outputs[0], &expected.outputs[0])
    }
}

mod backward {
    use super::*;

    fn loss(lstm: &mut Lstm, values: &[f32]) -> Result<f32, Box<dyn Error>> {
        let pass = forward(lstm, &[&sequence(values)], false)?;
        Ok(pass.outputs[0].data().sum())
    }

    #[test]
    fn matches_finite_differences() -> Result<(), Box<dyn Error>> {
        let values = [1., -2., 0.5];
        let input = sequence(&values);
        let mut lstm = lstm()?;
        let pass = forward(&mut lstm, &[&input], true)?;
        let ones = Blob::full(pass.outputs[0].desc(), 1.);
        let zeros = Blob::zeros(pass.outputs[1].desc());
        let diffs = backward(&mut lstm, &[&input], &pass, &[ones, zeros])?;

        let eps = 1e-2;
        let mut numeric = Vec::with_capacity(values.len());
        for t in 0..values.len() {
            let (mut up, mut down) = (values, values);
            up[t] += eps;
            down[t] -= eps;
            numeric.push((loss(&mut lstm, &up)? - loss(&mut lstm, &down)?) / (2. * eps));
        }
        for (analytic, numeric) in diffs[0].data().iter().zip(&numeric) {
            assert!(
                (analytic - numeric).abs() < 1e-3,
                "analytic {} vs numeric {}",
                analytic,
                numeric
            );
        }
        Ok(())
    }

    #[test]
    fn recurrent_weights_match_finite_differences() -> Result<(), Box<dyn Error>> {
        let values = [1., -2., 0.5, 1.5];
        let weights = [0.3, -0.2, 0.4, 0.1];
        let input = sequence(&values);
        let mut lstm = lstm()?;
        let pass = forward(&mut lstm, &[&input], true)?;
        let ones = Blob::full(pass.outputs[0].desc(), 1.);
        let zeros = Blob::zeros(pass.outputs[1].desc());
        crate::utils::learn(&mut lstm, &[&input], &pass, &[ones, zeros])?;
        let analytic = lstm
            .cell()
            .graph()
            .layer::<FullyConnected>(RECUR_HIDDEN)?
            .weights_diff()
            .ok_or("no recurrent weights gradient")?
            .to_vec();

        let eps = 1e-2;
        for (k, analytic) in analytic.iter().enumerate() {
            let (mut up, mut down) = (weights, weights);
            up[k] += eps;
            down[k] -= eps;
            lstm.set_recur_weights(Some(projection(&up)))?;
            let upper = loss(&mut lstm, &values)?;
            lstm.set_recur_weights(Some(projection(&down)))?;
            let lower = loss(&mut lstm, &values)?;
            lstm.set_recur_weights(Some(projection(&weights)))?;

            let numeric = (upper - lower) / (2. * eps);
            assert!(
                (analytic - numeric).abs() < 2e-3,
                "weight {}: analytic {} vs numeric {}",
                k,
                analytic,
                numeric
            );
        }
        Ok(())
    }

    #[test]
    fn parameter_gradients() -> Result<(), Box<dyn Error>> {
        let input = sequence(&[1., -2.]);
        let mut lstm = lstm()?;
        let pass = forward(&mut lstm, &[&input], true)?;
        let ones = Blob::full(pass.outputs[0].desc(), 1.);
        let zeros = Blob::zeros(pass.outputs[1].desc());
        crate::utils::learn(&mut lstm, &[&input], &pass, &[ones, zeros])?;

        let params = lstm.parameters();
        assert_eq!(params.len(), 4);
        assert!(params.iter().any(|param| param.diff.data().iter().any(|&g| g != 0.)));
        Ok(())
    }
}
