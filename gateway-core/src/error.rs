use flux::error::NetworkError;

/// Wire-facing status carried in a `GatewayErr` envelope (spec §6/§7); mirrors
/// `gateway.v1.GatewayError.Status` one-for-one.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum GatewayError {
    PackageErr,
    DecryptErr,
    ActionErr,
    NoActionHandler,
    NoAuth,
    InternalErr,
}

impl GatewayError {
    pub fn status_code(self) -> i32 {
        match self {
            GatewayError::PackageErr => 0,
            GatewayError::DecryptErr => 1,
            GatewayError::ActionErr => 2,
            GatewayError::NoActionHandler => 3,
            GatewayError::NoAuth => 4,
            GatewayError::InternalErr => 5,
        }
    }
}

impl From<NetworkError> for GatewayError {
    fn from(_: NetworkError) -> Self {
        GatewayError::PackageErr
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for GatewayError {}
