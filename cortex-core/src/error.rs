use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A setter or constructor received a value outside its domain.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("a layer named `{0}` already exists")]
    DuplicateName(String),

    #[error("no layer named `{0}`")]
    LayerNotFound(String),

    /// Shape or wiring validation failed while reshaping.
    #[error("architecture error in `{layer}`: {message}")]
    Architecture { layer: String, message: String },

    /// Operation requested in the wrong lifecycle phase.
    #[error("invalid state: {0}")]
    State(String),

    #[error("{what} version {version} is not supported (supported {min}..={max})")]
    UnsupportedVersion {
        what: String,
        version: u32,
        min: u32,
        max: u32,
    },

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Architecture error not yet attributed to a layer. The graph fills the
    /// layer name in with [`Error::in_layer`].
    pub fn architecture(message: impl Into<String>) -> Self {
        Error::Architecture {
            layer: String::new(),
            message: message.into(),
        }
    }

    pub fn in_layer(self, name: &str) -> Self {
        match self {
            Error::Architecture { layer, message } if layer.is_empty() => Error::Architecture {
                layer: name.to_owned(),
                message,
            },
            other => other,
        }
    }
}

/// Returns an architecture error from the enclosing function when the
/// condition does not hold.
#[macro_export]
macro_rules! check_architecture {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err($crate::Error::architecture(format!($($arg)*)));
        }
    };
}

#[cfg(test)]
mod test {
    use super::*;

    fn failing() -> Result<()> {
        check_architecture!(1 + 1 == 3, "expected {} inputs", 2);
        Ok(())
    }

    #[test]
    fn architecture_gets_layer_once() {
        let err = failing().unwrap_err().in_layer("split").in_layer("outer");
        match err {
            Error::Architecture { layer, message } => {
                assert_eq!(layer, "split");
                assert_eq!(message, "expected 2 inputs");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn other_errors_pass_through() {
        let err = Error::State("idle".into()).in_layer("sum");
        assert!(matches!(err, Error::State(_)));
    }
}
