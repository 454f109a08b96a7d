use anyhow::{anyhow, Context, Result};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

const MAX_GET_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 500;

/// USDⓈ-M futures REST client. Signed endpoints use HMAC-SHA256 over the
/// query string; idempotent GETs retry with doubling backoff, order
/// placement never does.
#[derive(Debug, Clone)]
pub struct FuturesClient {
    pub client: Client,
    api_key: String,
    secret_key: String,
    pub base_url: String,
    recv_window: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Kline {
    pub open_time: u64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub close_time: u64,
    pub quote_asset_volume: String,
    pub number_of_trades: u32,
}

impl Kline {
    /// Futures klines arrive as positional JSON arrays.
    pub fn from_row(row: &[serde_json::Value]) -> Result<Self> {
        let num = |i: usize| -> Result<u64> {
            row.get(i)
                .and_then(|v| v.as_u64())
                .ok_or_else(|| anyhow!("kline field {} is not a number", i))
        };
        let text = |i: usize| -> Result<String> {
            row.get(i)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| anyhow!("kline field {} is not a string", i))
        };

        Ok(Self {
            open_time: num(0)?,
            open: text(1)?,
            high: text(2)?,
            low: text(3)?,
            close: text(4)?,
            volume: text(5)?,
            close_time: num(6)?,
            quote_asset_volume: text(7)?,
            number_of_trades: num(8)? as u32,
        })
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PriceTicker {
    pub symbol: String,
    pub price: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BookTicker {
    pub symbol: String,
    #[serde(rename = "bidPrice")]
    pub bid_price: String,
    #[serde(rename = "bidQty")]
    pub bid_qty: String,
    #[serde(rename = "askPrice")]
    pub ask_price: String,
    #[serde(rename = "askQty")]
    pub ask_qty: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Ticker24hr {
    pub symbol: String,
    #[serde(rename = "priceChangePercent")]
    pub price_change_percent: String,
    #[serde(rename = "weightedAvgPrice")]
    pub weighted_avg_price: String,
    #[serde(rename = "lastPrice")]
    pub last_price: String,
    #[serde(rename = "highPrice")]
    pub high_price: String,
    #[serde(rename = "lowPrice")]
    pub low_price: String,
    pub volume: String,
    #[serde(rename = "quoteVolume")]
    pub quote_volume: String,
    #[serde(rename = "openTime")]
    pub open_time: u64,
    #[serde(rename = "closeTime")]
    pub close_time: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FuturesAccount {
    #[serde(rename = "feeTier")]
    pub fee_tier: u32,
    #[serde(rename = "canTrade")]
    pub can_trade: bool,
    #[serde(rename = "canDeposit")]
    pub can_deposit: bool,
    #[serde(rename = "canWithdraw")]
    pub can_withdraw: bool,
    #[serde(rename = "totalWalletBalance")]
    pub total_wallet_balance: String,
    #[serde(rename = "totalUnrealizedProfit")]
    pub total_unrealized_profit: String,
    #[serde(rename = "totalMarginBalance")]
    pub total_margin_balance: String,
    #[serde(rename = "availableBalance")]
    pub available_balance: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PositionRisk {
    pub symbol: String,
    #[serde(rename = "positionAmt")]
    pub position_amt: String,
    #[serde(rename = "entryPrice")]
    pub entry_price: String,
    #[serde(rename = "markPrice")]
    pub mark_price: String,
    #[serde(rename = "unRealizedProfit")]
    pub unrealized_profit: String,
    #[serde(rename = "liquidationPrice")]
    pub liquidation_price: String,
    pub leverage: String,
    #[serde(rename = "marginType")]
    pub margin_type: String,
    #[serde(rename = "positionSide")]
    pub position_side: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OrderResponse {
    #[serde(rename = "orderId")]
    pub order_id: u64,
    pub symbol: String,
    pub status: String,
    #[serde(rename = "clientOrderId")]
    pub client_order_id: String,
    pub price: String,
    #[serde(rename = "avgPrice")]
    pub avg_price: String,
    #[serde(rename = "origQty")]
    pub orig_qty: String,
    #[serde(rename = "executedQty")]
    pub executed_qty: String,
    #[serde(rename = "cumQuote")]
    pub cum_quote: String,
    #[serde(rename = "timeInForce")]
    pub time_in_force: String,
    #[serde(rename = "type")]
    pub order_type: String,
    #[serde(rename = "reduceOnly")]
    pub reduce_only: bool,
    #[serde(rename = "closePosition")]
    pub close_position: bool,
    pub side: String,
    #[serde(rename = "stopPrice")]
    pub stop_price: String,
    #[serde(rename = "updateTime")]
    pub update_time: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LeverageResponse {
    pub leverage: u32,
    #[serde(rename = "maxNotionalValue")]
    pub max_notional_value: String,
    pub symbol: String,
}

impl FuturesClient {
    pub fn new(api_key: String, secret_key: String, base_url: String, recv_window: u64) -> Self {
        Self {
            client: Client::new(),
            api_key,
            secret_key,
            base_url,
            recv_window,
        }
    }

    fn get_timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as u64
    }

    fn sign(&self, query_string: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn build_query_string(&self, params: &HashMap<String, String>) -> String {
        let mut query_params = params.clone();
        query_params.insert("timestamp".to_string(), Self::get_timestamp().to_string());
        query_params.insert("recvWindow".to_string(), self.recv_window.to_string());

        let query_string = query_params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");

        let signature = self.sign(&query_string);
        format!("{query_string}&signature={signature}")
    }

    /// GET with bounded retry. Server errors and transport failures back off
    /// and retry; client errors surface the exchange message immediately.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: Option<&HashMap<String, String>>,
    ) -> Result<T> {
        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);

        for attempt in 1..=MAX_GET_ATTEMPTS {
            // Signed queries are rebuilt per attempt so the timestamp stays
            // inside the recv window
            let url = match query {
                Some(params) => {
                    format!("{}{}?{}", self.base_url, path, self.build_query_string(params))
                }
                None => format!("{}{}", self.base_url, path),
            };

            let mut request = self.client.get(&url);
            if query.is_some() {
                request = request.header("X-MBX-APIKEY", &self.api_key);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json::<T>().await?);
                    }

                    let body = response.text().await.unwrap_or_default();
                    if !status.is_server_error() || attempt == MAX_GET_ATTEMPTS {
                        return Err(anyhow!("GET {path} failed with {status}: {body}"));
                    }
                    log::warn!("GET {path} returned {status}, retry {attempt} in {delay:?}");
                }
                Err(e) => {
                    if attempt == MAX_GET_ATTEMPTS {
                        return Err(e).context(format!("GET {path} failed after retries"));
                    }
                    log::warn!("GET {path} transport error ({e}), retry {attempt} in {delay:?}");
                }
            }

            tokio::time::sleep(delay).await;
            delay *= 2;
        }

        Err(anyhow!("GET {path}: retries exhausted"))
    }

    async fn send_signed(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &HashMap<String, String>,
    ) -> Result<reqwest::Response> {
        let query_string = self.build_query_string(params);
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(query_string)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("{path} failed with {status}: {error_text}"));
        }

        Ok(response)
    }

    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: u16) -> Result<Vec<Kline>> {
        let path = format!("/fapi/v1/klines?symbol={symbol}&interval={interval}&limit={limit}");
        let rows: Vec<Vec<serde_json::Value>> = self.get_json(&path, None).await?;

        rows.iter().map(|row| Kline::from_row(row)).collect()
    }

    pub async fn get_ticker_price(&self, symbol: &str) -> Result<PriceTicker> {
        let path = format!("/fapi/v1/ticker/price?symbol={symbol}");
        self.get_json(&path, None).await
    }

    pub async fn get_book_ticker(&self, symbol: &str) -> Result<BookTicker> {
        let path = format!("/fapi/v1/ticker/bookTicker?symbol={symbol}");
        self.get_json(&path, None).await
    }

    pub async fn get_24hr_ticker(&self, symbol: &str) -> Result<Ticker24hr> {
        let path = format!("/fapi/v1/ticker/24hr?symbol={symbol}");
        self.get_json(&path, None).await
    }

    pub async fn get_account(&self) -> Result<FuturesAccount> {
        self.get_json("/fapi/v2/account", Some(&HashMap::new())).await
    }

    pub async fn get_position_risk(&self, symbol: &str) -> Result<Vec<PositionRisk>> {
        let mut params = HashMap::new();
        params.insert("symbol".to_string(), symbol.to_string());
        self.get_json("/fapi/v2/positionRisk", Some(&params)).await
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<LeverageResponse> {
        let mut params = HashMap::new();
        params.insert("symbol".to_string(), symbol.to_string());
        params.insert("leverage".to_string(), leverage.to_string());

        let response = self
            .send_signed(reqwest::Method::POST, "/fapi/v1/leverage", &params)
            .await?;
        Ok(response.json::<LeverageResponse>().await?)
    }

    /// The exchange rejects a no-op change with code -4046; that case is
    /// treated as success.
    pub async fn set_margin_type(&self, symbol: &str, margin_type: &str) -> Result<()> {
        let mut params = HashMap::new();
        params.insert("symbol".to_string(), symbol.to_string());
        params.insert("marginType".to_string(), margin_type.to_string());

        match self
            .send_signed(reqwest::Method::POST, "/fapi/v1/marginType", &params)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("-4046") => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn place_market_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: &str,
        reduce_only: bool,
    ) -> Result<OrderResponse> {
        let mut params = HashMap::new();
        params.insert("symbol".to_string(), symbol.to_string());
        params.insert("side".to_string(), side.to_string());
        params.insert("type".to_string(), "MARKET".to_string());
        params.insert("quantity".to_string(), quantity.to_string());
        if reduce_only {
            params.insert("reduceOnly".to_string(), "true".to_string());
        }

        let response = self
            .send_signed(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;
        Ok(response.json::<OrderResponse>().await?)
    }

    /// Protective order that flattens the whole position when triggered.
    /// `order_type` is STOP_MARKET or TAKE_PROFIT_MARKET.
    pub async fn place_close_trigger(
        &self,
        symbol: &str,
        side: &str,
        order_type: &str,
        stop_price: &str,
    ) -> Result<OrderResponse> {
        let mut params = HashMap::new();
        params.insert("symbol".to_string(), symbol.to_string());
        params.insert("side".to_string(), side.to_string());
        params.insert("type".to_string(), order_type.to_string());
        params.insert("stopPrice".to_string(), stop_price.to_string());
        params.insert("closePosition".to_string(), "true".to_string());
        params.insert("workingType".to_string(), "MARK_PRICE".to_string());

        let response = self
            .send_signed(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;
        Ok(response.json::<OrderResponse>().await?)
    }

    /// Cancels every open order on the symbol, including protective triggers.
    pub async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        let mut params = HashMap::new();
        params.insert("symbol".to_string(), symbol.to_string());

        self.send_signed(reqwest::Method::DELETE, "/fapi/v1/allOpenOrders", &params)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kline_from_row_parses_the_futures_array_shape() {
        let row = vec![
            json!(1700000000000u64),
            json!("42000.10"),
            json!("42150.00"),
            json!("41900.50"),
            json!("42100.00"),
            json!("1234.567"),
            json!(1700000299999u64),
            json!("52000000.00"),
            json!(9876),
            json!("600.0"),
            json!("25000000.0"),
            json!("0"),
        ];

        let kline = Kline::from_row(&row).unwrap();
        assert_eq!(kline.open_time, 1700000000000);
        assert_eq!(kline.close, "42100.00");
        assert_eq!(kline.number_of_trades, 9876);
    }

    #[test]
    fn test_kline_from_row_rejects_malformed_rows() {
        let row = vec![json!("not-a-timestamp"), json!("42000.10")];
        assert!(Kline::from_row(&row).is_err());

        assert!(Kline::from_row(&[]).is_err());
    }

    #[test]
    fn test_order_response_deserializes_exchange_payload() {
        let payload = json!({
            "orderId": 4123456789u64,
            "symbol": "BTCUSDT",
            "status": "FILLED",
            "clientOrderId": "x-abc123",
            "price": "0",
            "avgPrice": "42100.50",
            "origQty": "0.010",
            "executedQty": "0.010",
            "cumQuote": "421.005",
            "timeInForce": "GTC",
            "type": "MARKET",
            "reduceOnly": false,
            "closePosition": false,
            "side": "BUY",
            "stopPrice": "0",
            "updateTime": 1700000000123u64
        });

        let order: OrderResponse = serde_json::from_value(payload).unwrap();
        assert_eq!(order.order_id, 4123456789);
        assert_eq!(order.avg_price, "42100.50");
        assert!(!order.reduce_only);
    }
}
