use std::error::Error;

use cortex_core::{Blob, BlobDesc};
use serde_json::json;

use crate::{
    layer::Layer,
    utils::{are_similar, backward, forward, row},
    LayerRegistry,
};

use super::Sink;

mod forward {
    use super::*;

    #[test]
    fn no_outputs() -> Result<(), Box<dyn Error>> {
        let input = row(&[1., 2.]);
        let pass = forward(&mut Sink::new(), &[&input], false)?;

        assert!(pass.outputs.is_empty());
        assert!(pass.scratch.is_empty());
        Ok(())
    }

    #[test]
    fn mismatched_diff() {
        let mut sink = Sink::new();
        sink.set_diff(Some(row(&[1., 2., 3.])));
        assert!(matches!(
            sink.reshape(&[BlobDesc::channels_only(2)]),
            Err(cortex_core::Error::Architecture { .. })
        ));

        sink.set_diff(None);
        assert!(sink.reshape(&[BlobDesc::channels_only(2)]).is_ok());
    }

    #[test]
    fn oldest_record() -> Result<(), Box<dyn Error>> {
        let restored = Sink::load(1000, json!({}), &LayerRegistry::default())?;
        let restored = restored.as_any().downcast_ref::<Sink>().unwrap();
        assert!(restored.diff().is_none());
        Ok(())
    }
}

mod backward {
    use super::*;

    #[test]
    fn sends_its_diff_upstream() -> Result<(), Box<dyn Error>> {
        let input = row(&[1., 2.]);
        let mut sink = Sink::new();
        sink.set_diff(Some(row(&[0.5, -1.])));
        let pass = forward(&mut sink, &[&input], true)?;
        let diffs = backward(&mut sink, &[&input], &pass, &[])?;

        are_similar(&diffs[0], &row(&[0.5, -1.]))
    }

    #[test]
    fn without_diff() -> Result<(), Box<dyn Error>> {
        let input = row(&[1., 2.]);
        let mut sink = Sink::new();
        let pass = forward(&mut sink, &[&input], true)?;
        let diffs = backward(&mut sink, &[&input], &pass, &[])?;

        are_similar(&diffs[0], &Blob::zeros(input.desc()))
    }
}
