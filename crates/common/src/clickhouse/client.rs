use anyhow::{Context, Result};
use clickhouse::Client;
use tracing::info;

/// Connection to a ClickHouse server. Databases play the role of datasets, so
/// the client is not bound to one and every statement names its database.
#[derive(Clone)]
pub struct ClickHouseClient {
    client: Client,
}

impl ClickHouseClient {
    pub fn new(url: &str, username: &str, password: &str) -> Self {
        let client = Client::default()
            .with_url(url)
            .with_user(username)
            .with_password(password)
            .with_compression(clickhouse::Compression::Lz4)
            // Rows travel as JSONEachRow; keep Int64 numeric and accept ISO datetimes.
            .with_option("output_format_json_quote_64bit_integers", "0")
            .with_option("date_time_input_format", "best_effort");

        Self { client }
    }

    pub async fn ping(&self) -> Result<()> {
        self.client
            .query("SELECT 1")
            .fetch_one::<u8>()
            .await
            .context("ClickHouse did not answer ping")?;
        info!("ClickHouse connection verified");
        Ok(())
    }

    pub fn get_client(&self) -> &Client {
        &self.client
    }

    /// Copy of the client whose queries run at reduced scheduling priority.
    pub fn low_priority(&self) -> Client {
        self.client.clone().with_option("priority", "10")
    }
}
