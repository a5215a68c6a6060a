use std::fmt::{Debug, Display};
use tilepipe_runtime::{AllocationError, DType, LaunchError};

use super::LayoutKind;

/// Errors that can occur while preparing a matmul, before anything runs on the device.
pub enum MatmulSetupError {
    /// The tile configuration is rejected by a component.
    InvalidConfig(InvalidConfigError),

    /// No pre-instantiated kernel exists for the requested combination.
    Unsupported(MatmulAvailabilityError),

    /// A grouped problem lists more groups than the kernel can address.
    TooManyGroups { count: usize, max: usize },

    /// A caller supplied workspace is smaller than what the kernel needs.
    WorkspaceTooSmall { required: usize, actual: usize },

    /// A buffer does not hold the elements its layout addresses.
    BufferTooSmall {
        operand: &'static str,
        required: usize,
        actual: usize,
    },

    /// Workspace allocation on the device failed.
    Allocation(AllocationError),
}

/// A combination of element types, layouts and strategy that no kernel implements.
pub enum MatmulAvailabilityError {
    Types { a: DType, b: DType, c: DType },
    Layouts { a: LayoutKind, b: LayoutKind },
    Strategy { strategy: String, reason: &'static str },
}

impl From<MatmulAvailabilityError> for MatmulSetupError {
    fn from(value: MatmulAvailabilityError) -> Self {
        Self::Unsupported(value)
    }
}

impl From<InvalidConfigError> for MatmulSetupError {
    fn from(value: InvalidConfigError) -> Self {
        Self::InvalidConfig(value)
    }
}

impl From<AllocationError> for MatmulSetupError {
    fn from(value: AllocationError) -> Self {
        Self::Allocation(value)
    }
}

impl Display for MatmulSetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Debug for MatmulSetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatmulSetupError::InvalidConfig(err) => {
                write!(
                    f,
                    "Unable to launch matmul because the config is invalid: {err}"
                )
            }
            MatmulSetupError::Unsupported(err) => {
                write!(
                    f,
                    "Unable to launch matmul because no kernel supports the request: {err:?}"
                )
            }
            MatmulSetupError::TooManyGroups { count, max } => {
                write!(f, "Grouped matmul with {count} groups exceeds the limit of {max}")
            }
            MatmulSetupError::WorkspaceTooSmall { required, actual } => {
                write!(
                    f,
                    "Workspace of {actual} bytes is too small, the kernel needs {required} bytes"
                )
            }
            MatmulSetupError::BufferTooSmall {
                operand,
                required,
                actual,
            } => {
                write!(
                    f,
                    "Operand {operand} holds {actual} bytes but its layout addresses {required} bytes"
                )
            }
            MatmulSetupError::Allocation(err) => {
                write!(f, "Unable to allocate the matmul workspace\nCaused by:\n  {err}")
            }
        }
    }
}

impl std::error::Error for MatmulSetupError {}

impl Debug for MatmulAvailabilityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatmulAvailabilityError::Types { a, b, c } => {
                write!(f, "Types a={a}, b={b}, c={c} not supported.")
            }
            MatmulAvailabilityError::Layouts { a, b } => {
                write!(f, "Layouts a={a:?}, b={b:?} not supported.")
            }
            MatmulAvailabilityError::Strategy { strategy, reason } => {
                write!(f, "Strategy {strategy} not supported: {reason}.")
            }
        }
    }
}

/// Error that arises from invalid configurations
pub type InvalidConfigError = Box<dyn Display>;

/// Error that arises from invalid configurations, formatted lazily.
pub struct FormattedConfigError {
    func: Box<dyn Fn() -> String>,
}

impl FormattedConfigError {
    #[allow(clippy::new_ret_no_self)]
    pub fn new<F: Fn() -> String + 'static>(func: F) -> Box<dyn Display> {
        Box::new(Self {
            func: Box::new(func),
        })
    }
}

impl Display for FormattedConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let string = (self.func)();
        write!(f, "{string}")
    }
}

/// Failure of a host side matmul launch.
#[derive(thiserror::Error)]
pub enum MatmulLaunchError {
    #[error("{0}")]
    Setup(#[from] MatmulSetupError),

    #[error("Matmul kernel failed on the device\nCaused by:\n  {0}")]
    Launch(#[from] LaunchError),
}

impl Debug for MatmulLaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{self}"))
    }
}

impl From<AllocationError> for MatmulLaunchError {
    fn from(value: AllocationError) -> Self {
        Self::Setup(MatmulSetupError::Allocation(value))
    }
}

impl From<InvalidConfigError> for MatmulLaunchError {
    fn from(value: InvalidConfigError) -> Self {
        Self::Setup(MatmulSetupError::InvalidConfig(value))
    }
}
