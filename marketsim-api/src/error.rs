//! Mapping of domain errors onto RPC status codes

use tonic::Status;

/// Convert a core error into the status returned to callers
pub fn status_from_core(err: marketsim_core::Error) -> Status {
    use marketsim_core::Error;

    match err {
        Error::InvalidInput(msg) => Status::invalid_argument(msg),
        Error::NotFound(msg) => Status::not_found(msg),
        Error::Configuration(e) => Status::failed_precondition(e.to_string()),
        Error::Internal(msg) => Status::internal(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_core_errors_map_to_codes() {
        let status = status_from_core(marketsim_core::Error::InvalidInput("symbol is required".into()));
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "symbol is required");

        let status = status_from_core(marketsim_core::Error::Internal("boom".into()));
        assert_eq!(status.code(), Code::Internal);
    }
}
