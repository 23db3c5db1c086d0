use std::error::Error;

use crate::utils::{are_similar, backward, forward, row};

use super::EltwiseNegMul;

mod forward {
    use super::*;

    #[test]
    fn base_case() -> Result<(), Box<dyn Error>> {
        let (a, b) = (row(&[0.25, 1., 0.]), row(&[4., 3., -2.]));
        let pass = forward(&mut EltwiseNegMul, &[&a, &b], false)?;

        are_similar(&pass.outputs[0], &row(&[3., 0., -2.]))
    }
}

mod backward {
    use super::*;

    #[test]
    fn three_inputs() -> Result<(), Box<dyn Error>> {
        let (a, b, c) = (row(&[0.5, 0.]), row(&[2., 3.]), row(&[4., -1.]));
        let mut layer = EltwiseNegMul;
        let pass = forward(&mut layer, &[&a, &b, &c], true)?;
        are_similar(&pass.outputs[0], &row(&[4., -3.]))?;

        let diffs = backward(&mut layer, &[&a, &b, &c], &pass, &[row(&[1., 2.])])?;
        are_similar(&diffs[0], &row(&[-8., 6.]))?;
        are_similar(&diffs[1], &row(&[2., -2.]))?;
        are_similar(&diffs[2], &row(&[1., 6.]))
    }
}
