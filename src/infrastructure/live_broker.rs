//! Live broker backed by the CLOB

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::domain::entities::order::{OrderRequest, OrderSnapshot, OrderStatus};
use crate::domain::repositories::broker_adapter::{
    BookLevel, BookSide, BrokerAdapter, BrokerError, BrokerResult,
};
use crate::infrastructure::clob_client::{
    parse_decimal, AssetType, BookEntry, ClobClient, OpenOrderResponse,
};

pub struct LiveBroker {
    client: ClobClient,
}

impl LiveBroker {
    pub fn new(client: ClobClient) -> BrokerResult<Self> {
        let address = client.signer()?.address();
        info!("Live broker ready for {:?} on {}", address, client.host());
        Ok(Self { client })
    }
}

/// Book levels sorted best first: asks ascending, bids descending
pub fn sorted_levels(entries: &[BookEntry], side: BookSide, depth: usize) -> BrokerResult<Vec<BookLevel>> {
    let mut levels = entries
        .iter()
        .map(|e| {
            Ok(BookLevel {
                price: parse_decimal(&e.price, "book price")?,
                size: parse_decimal(&e.size, "book size")?,
            })
        })
        .collect::<BrokerResult<Vec<_>>>()?;

    levels.retain(|l| l.size > 0.0);
    match side {
        BookSide::Asks => levels.sort_by(|a, b| a.price.total_cmp(&b.price)),
        BookSide::Bids => levels.sort_by(|a, b| b.price.total_cmp(&a.price)),
    }
    levels.truncate(depth);
    Ok(levels)
}

/// Venue status strings to the engine's lifecycle
pub fn snapshot_from(order: &OpenOrderResponse) -> BrokerResult<OrderSnapshot> {
    let size_matched = match order.size_matched.as_deref() {
        Some(raw) if !raw.is_empty() => parse_decimal(raw, "size_matched")?,
        _ => 0.0,
    };
    let price = match order.price.as_deref() {
        Some(raw) if !raw.is_empty() => parse_decimal(raw, "price")?,
        _ => 0.0,
    };

    let status = match order.status.to_uppercase().as_str() {
        "MATCHED" | "FILLED" => OrderStatus::Filled,
        "LIVE" | "DELAYED" | "UNMATCHED" if size_matched > 0.0 => OrderStatus::PartiallyFilled,
        "LIVE" | "DELAYED" | "UNMATCHED" => OrderStatus::Open,
        "CANCELED" | "CANCELLED" | "CANCELED_MARKET_RESOLVED" => OrderStatus::Cancelled,
        other => {
            warn!("Unknown order status {:?} for {}", other, order.id);
            OrderStatus::Pending
        }
    };

    Ok(OrderSnapshot {
        order_id: order.id.clone(),
        status,
        size_matched,
        price,
    })
}

#[async_trait]
impl BrokerAdapter for LiveBroker {
    fn name(&self) -> &str {
        "live"
    }

    async fn get_price(&self, token_id: &str) -> BrokerResult<f64> {
        self.client.price(token_id).await
    }

    async fn get_order_book_levels(
        &self,
        token_id: &str,
        side: BookSide,
        depth: usize,
    ) -> BrokerResult<Vec<BookLevel>> {
        let book = self.client.order_book(token_id).await?;
        let entries = match side {
            BookSide::Asks => &book.asks,
            BookSide::Bids => &book.bids,
        };
        sorted_levels(entries, side, depth)
    }

    async fn place_order(&self, order: &OrderRequest) -> BrokerResult<String> {
        let salt: u64 = rand::thread_rng().gen_range(1..u64::from(u32::MAX));
        let signed = self.client.signer()?.sign(order, salt)?;
        let response = self
            .client
            .post_order(&signed, &order.order_type.to_string())
            .await?;

        if !response.success {
            let reason = response
                .error_msg
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "order not accepted".to_string());
            return Err(BrokerError::Rejected(reason));
        }

        let order_id = response
            .order_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| BrokerError::Malformed("order accepted without an id".to_string()))?;

        debug!(
            "Live order {} accepted ({})",
            order_id,
            response.status.as_deref().unwrap_or("?")
        );
        Ok(order_id)
    }

    async fn get_order_status(&self, order_id: &str) -> BrokerResult<OrderSnapshot> {
        let order = self.client.get_order(order_id).await?;
        snapshot_from(&order)
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        let response = self.client.cancel(order_id).await?;
        if let Some(reason) = response.not_canceled.get(order_id) {
            debug!("Cancel of {} not applied: {}", order_id, reason);
        }
        Ok(())
    }

    async fn cancel_all_orders(&self) -> BrokerResult<()> {
        let response = self.client.cancel_all().await?;
        info!("Cancel-all removed {} orders", response.canceled.len());
        Ok(())
    }

    async fn get_balance(&self) -> BrokerResult<f64> {
        self.client.balance(AssetType::Collateral, None).await
    }

    async fn get_token_balance(&self, token_id: &str) -> BrokerResult<Option<f64>> {
        self.client
            .balance(AssetType::Conditional, Some(token_id))
            .await
            .map(Some)
    }
}
