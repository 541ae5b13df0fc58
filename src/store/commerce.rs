//! Commerce: order decoration, buying and purchase readiness.

use serde::{Deserialize, Serialize};

use crate::auth::UserCredentials;
use crate::client::{RequestOptions, JSON_CONTENT_TYPE};
use crate::store::error::StoreError;
use crate::store::{Store, BUY_ENDPOINT, CUSTOMERS_ME_ENDPOINT, ORDERS_ENDPOINT};
use crate::types::SnapInfo;

#[derive(Debug, Default, Deserialize)]
struct OrdersResult {
    #[serde(default)]
    orders: Vec<Order>,
}

#[derive(Debug, Default, Deserialize)]
struct Order {
    #[serde(default)]
    snap_id: String,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Default, Deserialize)]
struct StoreErrors {
    #[serde(default)]
    error_list: Vec<StoreErrorJson>,
}

#[derive(Debug, Default, Deserialize)]
struct StoreErrorJson {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl StoreErrors {
    fn code(&self) -> &str {
        self.error_list.first().map(|e| e.code.as_str()).unwrap_or("")
    }

    fn message(&self) -> String {
        self.error_list
            .first()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "internal error: empty store error used as an actual error".into())
    }
}

/// A non-free snap needs buying unless the user already ordered it.
fn must_buy(paid: bool, bought: bool) -> bool {
    paid && !bought
}

/// What to buy and for how much.
#[derive(Debug, Clone, Default)]
pub struct BuyOptions {
    pub snap_id: String,
    pub price: f64,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct BuyResult {
    pub state: String,
}

#[derive(Serialize)]
struct OrderInstruction<'a> {
    snap_id: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    amount: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    currency: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct StoreCustomer {
    #[serde(default)]
    latest_tos_accepted: bool,
    #[serde(default)]
    has_payment_method: bool,
}

impl Store {
    /// Mark each snap's must-buy state according to the user's known
    /// orders. Free snaps never need buying; without a user every priced
    /// snap does.
    pub(crate) async fn decorate_orders(
        &self,
        snaps: &mut [SnapInfo],
        user: Option<&UserCredentials>,
    ) -> Result<(), StoreError> {
        let mut has_priced = false;
        for info in snaps.iter_mut() {
            if info.paid() {
                info.must_buy = true;
                has_priced = true;
            }
        }
        let Some(user) = user else {
            return Ok(());
        };
        if !has_priced {
            return Ok(());
        }

        let url = self.endpoint_url(ORDERS_ENDPOINT, &[]).await;
        let opts = RequestOptions::get(url).accept(JSON_CONTENT_TYPE);
        let (resp, result, _) = self
            .retry_request_decode::<OrdersResult, serde_json::Value>(&opts, Some(user))
            .await?;

        if resp.status.as_u16() == 401 {
            // TODO: support refreshing the expired token here instead of
            // asking the user to log in again
            return Err(StoreError::InvalidCredentials);
        }
        if resp.status.as_u16() != 200 {
            return Err(StoreError::unexpected_status(
                "obtain known orders from store",
                &resp,
            ));
        }

        let result = result.unwrap_or_default();
        for info in snaps.iter_mut() {
            let bought = result.orders.iter().any(|o| o.snap_id == info.snap_id);
            info.must_buy = must_buy(info.paid(), bought);
        }
        Ok(())
    }

    /// Send a buy request; the returned state is Complete or the purchase
    /// failed with a typed error.
    pub async fn buy(
        &self,
        options: &BuyOptions,
        user: Option<&UserCredentials>,
    ) -> Result<BuyResult, StoreError> {
        if options.snap_id.is_empty() {
            return Err(StoreError::Buy("snap ID missing".to_string()));
        }
        if options.price <= 0.0 {
            return Err(StoreError::Buy("invalid expected price".to_string()));
        }
        if options.currency.is_empty() {
            return Err(StoreError::Buy("currency missing".to_string()));
        }
        let Some(user) = user else {
            return Err(StoreError::Unauthenticated);
        };

        let amount = format!("{:.2}", options.price);
        let body = serde_json::to_vec(&OrderInstruction {
            snap_id: &options.snap_id,
            amount: &amount,
            currency: &options.currency,
        })?;

        let url = self.endpoint_url(BUY_ENDPOINT, &[]).await;
        let opts = RequestOptions::post(url)
            .accept(JSON_CONTENT_TYPE)
            .content_type(JSON_CONTENT_TYPE)
            .data(body);

        let (resp, order, errors) = self
            .retry_request_decode::<Order, StoreErrors>(&opts, Some(user))
            .await?;
        let errors = errors.unwrap_or_default();

        match resp.status.as_u16() {
            200 | 201 => {
                let order = order.unwrap_or_default();
                // the store reports an aborted payment as a successful
                // response carrying the Cancelled state
                if order.state == "Cancelled" {
                    return Err(StoreError::Buy("payment cancelled".to_string()));
                }
                Ok(BuyResult { state: order.state })
            }
            400 => Err(StoreError::Buy(format!("bad request: {}", errors.message()))),
            403 => match errors.code() {
                "no-payment-methods" => Err(StoreError::NoPaymentMethods),
                "tos-not-accepted" => Err(StoreError::TermsNotAccepted),
                _ => Err(StoreError::Buy(format!(
                    "permission denied: {}",
                    errors.message()
                ))),
            },
            404 => Err(StoreError::Buy(format!(
                "server says not found: {}",
                errors.message()
            ))),
            402 => Err(StoreError::PaymentDeclined),
            // TODO: expired tokens should refresh rather than bounce back
            // to the caller
            401 => Err(StoreError::InvalidCredentials),
            _ => Err(StoreError::unexpected_status(
                &format!("buy snap: {}", errors.message()),
                &resp,
            )),
        }
    }

    /// Whether the account can buy: terms accepted and a payment method on
    /// file.
    pub async fn ready_to_buy(&self, user: Option<&UserCredentials>) -> Result<(), StoreError> {
        let Some(user) = user else {
            return Err(StoreError::Unauthenticated);
        };

        let url = self.endpoint_url(CUSTOMERS_ME_ENDPOINT, &[]).await;
        let opts = RequestOptions::get(url).accept(JSON_CONTENT_TYPE);
        let (resp, customer, errors) = self
            .retry_request_decode::<StoreCustomer, StoreErrors>(&opts, Some(user))
            .await?;

        match resp.status.as_u16() {
            200 => {
                let customer = customer.unwrap_or_default();
                if !customer.has_payment_method {
                    return Err(StoreError::NoPaymentMethods);
                }
                if !customer.latest_tos_accepted {
                    return Err(StoreError::TermsNotAccepted);
                }
                Ok(())
            }
            404 => Err(StoreError::Protocol(
                "cannot get customer details: server says no account exists".to_string(),
            )),
            401 => Err(StoreError::InvalidCredentials),
            _ => {
                let errors = errors.unwrap_or_default();
                if errors.error_list.is_empty() {
                    return Err(StoreError::Protocol(format!(
                        "cannot get customer details: unexpected HTTP code {}",
                        resp.status.as_u16()
                    )));
                }
                Err(StoreError::Protocol(errors.message()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn must_buy_rules() {
        // free snaps never need buying
        assert!(!must_buy(false, false));
        assert!(!must_buy(false, true));
        // paid snaps need buying until bought
        assert!(must_buy(true, false));
        assert!(!must_buy(true, true));
    }

    #[test]
    fn order_instruction_wire_format() {
        let body = serde_json::to_value(OrderInstruction {
            snap_id: "abc",
            amount: "2.99",
            currency: "USD",
        })
        .unwrap();
        assert_eq!(body["snap_id"], "abc");
        assert_eq!(body["amount"], "2.99");
        assert_eq!(body["currency"], "USD");
    }
}
