use std::error::Error;

use crate::utils::{are_similar, backward, forward, row};

use super::EltwiseDiv;

mod forward {
    use super::*;

    #[test]
    fn base_case() -> Result<(), Box<dyn Error>> {
        let (a, b) = (row(&[4., 9.]), row(&[2., 3.]));
        let pass = forward(&mut EltwiseDiv, &[&a, &b], false)?;

        are_similar(&pass.outputs[0], &row(&[2., 3.]))
    }

    #[test]
    fn by_zero() -> Result<(), Box<dyn Error>> {
        let (a, b) = (row(&[1.]), row(&[0.]));
        let pass = forward(&mut EltwiseDiv, &[&a, &b], false)?;

        assert!(pass.outputs[0].to_vec()[0].is_infinite());
        Ok(())
    }
}

mod backward {
    use super::*;

    #[test]
    fn base_case() -> Result<(), Box<dyn Error>> {
        let (a, b) = (row(&[4., 9.]), row(&[2., 3.]));
        let mut layer = EltwiseDiv;
        let pass = forward(&mut layer, &[&a, &b], true)?;
        let diffs = backward(&mut layer, &[&a, &b], &pass, &[row(&[1., 1.])])?;

        are_similar(&diffs[0], &row(&[0.5, 1. / 3.]))?;
        are_similar(&diffs[1], &row(&[-1., -1.]))
    }
}
