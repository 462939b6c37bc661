//! Protocol definitions shared by the gRPC and Connect front-ends.
//!
//! Messages derive `serde` so the Connect JSON codec can use them directly.

pub mod marketdata {
    pub mod v1 {
        #![allow(clippy::all)]
        #![allow(warnings)]

        tonic::include_proto!("marketsim.marketdata.v1");
    }
}

pub use marketdata::v1;

/// Encoded file descriptor set for gRPC reflection
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("marketdata_descriptor");

/// Fully-qualified service name, also the Connect route prefix
pub const MARKET_DATA_SERVICE: &str = "marketsim.marketdata.v1.MarketDataService";

#[cfg(test)]
mod tests {
    use super::v1::{GetPriceRequest, PriceUpdate, SimulationType};

    #[test]
    fn test_missing_json_fields_default() {
        let req: GetPriceRequest = serde_json::from_str("{}").unwrap();
        assert!(req.symbol.is_empty());

        let update: PriceUpdate = serde_json::from_str(r#"{"symbol":"AAPL","price":1.5}"#).unwrap();
        assert_eq!(update.symbol, "AAPL");
        assert!(update.change_info.is_none());
    }

    #[test]
    fn test_enum_values_are_stable() {
        assert_eq!(SimulationType::MonteCarlo as i32, 2);
        assert_eq!(SimulationType::try_from(1).unwrap(), SimulationType::StatisticalSimilarity);
    }
}
