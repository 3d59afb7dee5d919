//! Collaborator seams for fetching fee data, together with the production
//! implementations backed by the gas fee HTTP API and an Ethereum node.

use {
    crate::estimates::{Eip1559Estimates, FeePerGas, FeeTierEstimate},
    alloy_primitives::U256,
    alloy_provider::Provider,
    anyhow::{Context, Result},
    reqwest::Client,
    std::time::Duration,
    url::Url,
};

/// Source of EIP-1559 fee estimate sets.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait::async_trait]
pub trait Eip1559EstimateFetching: Send + Sync {
    async fn eip1559_estimates(&self) -> Result<Eip1559Estimates>;
}

/// Answers legacy gas price queries, typically through whatever handle the
/// current network's node is reachable by.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait::async_trait]
pub trait GasPriceQuerying: Send + Sync {
    async fn gas_price(&self) -> Result<U256>;
}

/// Decides whether the active network supports EIP-1559 fee estimation.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait::async_trait]
pub trait NetworkCompatibility: Send + Sync {
    async fn supports_eip1559(&self) -> Result<bool>;
}

/// Decides whether the selected account can send EIP-1559 transactions.
/// Implementations answer from already known account data and cannot fail.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
pub trait AccountCompatibility: Send + Sync {
    fn supports_eip1559(&self) -> bool;
}

/// Client for the gas fee estimation HTTP API.
pub struct GasFeeApi {
    client: Client,
    url: Url,
}

impl GasFeeApi {
    pub fn new(client: Client, url: Url) -> Self {
        Self { client, url }
    }
}

#[async_trait::async_trait]
impl Eip1559EstimateFetching for GasFeeApi {
    async fn eip1559_estimates(&self) -> Result<Eip1559Estimates> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .context("failed to send gas fee estimate request")?
            .error_for_status()
            .context("gas fee estimate request returned an error status")?;
        let estimates: dto::Estimates = response
            .json()
            .await
            .context("failed to decode gas fee estimate response")?;
        estimates.try_into()
    }
}

/// Legacy gas price queries answered by an Ethereum node.
pub struct NodeGasPriceSource<P>(pub P);

#[async_trait::async_trait]
impl<P> GasPriceQuerying for NodeGasPriceSource<P>
where
    P: Provider,
{
    async fn gas_price(&self) -> Result<U256> {
        let wei = self
            .0
            .get_gas_price()
            .await
            .context("failed to query node gas price")?;
        Ok(U256::from(wei))
    }
}

mod dto {
    use {super::*, serde::Deserialize};

    /// Wire format of the fee estimate API. Unknown fields are rejected so
    /// that only the exact EIP-1559 shape ever becomes an estimate set; the
    /// legacy shape (a lone `gasPrice`) does not decode as this type.
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase", deny_unknown_fields)]
    pub struct Estimates {
        pub low: Tier,
        pub medium: Tier,
        pub high: Tier,
        /// Decimal gwei string.
        pub estimated_base_fee: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase", deny_unknown_fields)]
    pub struct Tier {
        /// Milliseconds.
        pub min_wait_time_estimate: u64,
        /// Milliseconds.
        pub max_wait_time_estimate: u64,
        /// Decimal gwei string.
        pub suggested_max_priority_fee_per_gas: String,
        /// Decimal gwei string.
        pub suggested_max_fee_per_gas: String,
    }

    impl TryFrom<Estimates> for Eip1559Estimates {
        type Error = anyhow::Error;

        fn try_from(estimates: Estimates) -> Result<Self> {
            Ok(Self {
                low: estimates.low.try_into().context("low tier")?,
                medium: estimates.medium.try_into().context("medium tier")?,
                high: estimates.high.try_into().context("high tier")?,
                estimated_base_fee: FeePerGas::from_gwei(&estimates.estimated_base_fee)
                    .context("estimated base fee")?,
            })
        }
    }

    impl TryFrom<Tier> for FeeTierEstimate {
        type Error = anyhow::Error;

        fn try_from(tier: Tier) -> Result<Self> {
            Ok(Self {
                min_wait: Duration::from_millis(tier.min_wait_time_estimate),
                max_wait: Duration::from_millis(tier.max_wait_time_estimate),
                suggested_max_priority_fee_per_gas: FeePerGas::from_gwei(
                    &tier.suggested_max_priority_fee_per_gas,
                )
                .context("suggested max priority fee")?,
                suggested_max_fee_per_gas: FeePerGas::from_gwei(&tier.suggested_max_fee_per_gas)
                    .context("suggested max fee")?,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::estimates::testing};

    #[test]
    fn decodes_the_api_response() {
        let response = serde_json::json!({
            "low": {
                "minWaitTimeEstimate": 120_000,
                "maxWaitTimeEstimate": 300_000,
                "suggestedMaxPriorityFeePerGas": "1",
                "suggestedMaxFeePerGas": "35"
            },
            "medium": {
                "minWaitTimeEstimate": 0,
                "maxWaitTimeEstimate": 30_000,
                "suggestedMaxPriorityFeePerGas": "2",
                "suggestedMaxFeePerGas": "40"
            },
            "high": {
                "minWaitTimeEstimate": 0,
                "maxWaitTimeEstimate": 150_000,
                "suggestedMaxPriorityFeePerGas": "3",
                "suggestedMaxFeePerGas": "60"
            },
            "estimatedBaseFee": "30"
        });
        let decoded: dto::Estimates = serde_json::from_value(response).unwrap();
        let estimates = Eip1559Estimates::try_from(decoded).unwrap();
        assert_eq!(estimates, testing::estimates());
    }

    #[test]
    fn rejects_shapes_that_are_not_eip1559_estimates() {
        // The legacy shape.
        let legacy = serde_json::json!({ "gasPrice": "30" });
        assert!(serde_json::from_value::<dto::Estimates>(legacy).is_err());

        // An extra field inside a tier.
        let extra = serde_json::json!({
            "low": {
                "minWaitTimeEstimate": 120_000,
                "maxWaitTimeEstimate": 300_000,
                "suggestedMaxPriorityFeePerGas": "1",
                "suggestedMaxFeePerGas": "35",
                "networkCongestion": 0.5
            },
            "medium": {
                "minWaitTimeEstimate": 0,
                "maxWaitTimeEstimate": 30_000,
                "suggestedMaxPriorityFeePerGas": "2",
                "suggestedMaxFeePerGas": "40"
            },
            "high": {
                "minWaitTimeEstimate": 0,
                "maxWaitTimeEstimate": 150_000,
                "suggestedMaxPriorityFeePerGas": "3",
                "suggestedMaxFeePerGas": "60"
            },
            "estimatedBaseFee": "30"
        });
        assert!(serde_json::from_value::<dto::Estimates>(extra).is_err());

        // A missing base fee.
        let missing = serde_json::json!({
            "low": {
                "minWaitTimeEstimate": 120_000,
                "maxWaitTimeEstimate": 300_000,
                "suggestedMaxPriorityFeePerGas": "1",
                "suggestedMaxFeePerGas": "35"
            },
            "medium": {
                "minWaitTimeEstimate": 0,
                "maxWaitTimeEstimate": 30_000,
                "suggestedMaxPriorityFeePerGas": "2",
                "suggestedMaxFeePerGas": "40"
            },
            "high": {
                "minWaitTimeEstimate": 0,
                "maxWaitTimeEstimate": 150_000,
                "suggestedMaxPriorityFeePerGas": "3",
                "suggestedMaxFeePerGas": "60"
            }
        });
        assert!(serde_json::from_value::<dto::Estimates>(missing).is_err());
    }

    #[test]
    fn reports_which_field_failed_to_parse() {
        let response = serde_json::json!({
            "low": {
                "minWaitTimeEstimate": 120_000,
                "maxWaitTimeEstimate": 300_000,
                "suggestedMaxPriorityFeePerGas": "oops",
                "suggestedMaxFeePerGas": "35"
            },
            "medium": {
                "minWaitTimeEstimate": 0,
                "maxWaitTimeEstimate": 30_000,
                "suggestedMaxPriorityFeePerGas": "2",
                "suggestedMaxFeePerGas": "40"
            },
            "high": {
                "minWaitTimeEstimate": 0,
                "maxWaitTimeEstimate": 150_000,
                "suggestedMaxPriorityFeePerGas": "3",
                "suggestedMaxFeePerGas": "60"
            },
            "estimatedBaseFee": "30"
        });
        let decoded: dto::Estimates = serde_json::from_value(response).unwrap();
        let err = Eip1559Estimates::try_from(decoded).unwrap_err();
        assert!(format!("{err:#}").contains("low tier"));
    }

    // cargo test -p gas-fee-watcher real_api -- --ignored
    #[tokio::test]
    #[ignore]
    async fn real_api() {
        observe::tracing::initialize_reentrant("gas_fee_watcher=debug");
        let url: Url = std::env::var("GAS_FEE_API_URL").unwrap().parse().unwrap();
        let api = GasFeeApi::new(Client::new(), url);
        let estimates = api.eip1559_estimates().await.unwrap();
        println!("{estimates:#?}");
    }

    // cargo test -p gas-fee-watcher real_node -- --ignored
    #[tokio::test]
    #[ignore]
    async fn real_node() {
        let url: Url = std::env::var("NODE_URL").unwrap().parse().unwrap();
        let provider = alloy_provider::ProviderBuilder::new().connect_http(url);
        let gas_price = NodeGasPriceSource(provider).gas_price().await.unwrap();
        println!("{gas_price}");
    }
}
