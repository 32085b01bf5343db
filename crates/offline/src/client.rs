//! Typed client for the catalog and trade endpoints.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::gateway::{GatewayError, RequestGateway};
use crate::operations::{
    ITEMS_ENDPOINT, ItemPatch, NewItem, NewParty, NewPurchase, NewSale, NewWarehouse,
    Operation, PARTIES_ENDPOINT, PURCHASES_ENDPOINT, PartyKind, PurchaseLine, SALES_ENDPOINT,
    SaleLine, Unit, WAREHOUSES_ENDPOINT, WarehousePatch,
};
use crate::types::{Request, is_placeholder_id};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    pub name: String,
    pub sku: String,
    pub unit: Unit,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub min_stock: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warehouse {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: PartyKind,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Purchase {
    pub id: String,
    pub supplier_id: String,
    pub date: NaiveDate,
    pub lines: Vec<PurchaseLine>,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sale {
    pub id: String,
    pub customer_id: String,
    pub date: NaiveDate,
    pub lines: Vec<SaleLine>,
    pub total: f64,
}

/// What a write returns: the record id, plus the computed total for
/// documents.
///
/// Deferred writes carry a placeholder id and no total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub id: String,
    #[serde(default)]
    pub total: Option<f64>,
}

impl Receipt {
    /// The write was queued and has not reached the server yet.
    pub fn is_provisional(&self) -> bool {
        is_placeholder_id(&self.id)
    }
}

/// Catalog and trade API over the request gateway.
#[derive(Clone)]
pub struct TradeClient {
    gateway: Arc<RequestGateway>,
}

impl TradeClient {
    pub fn new(gateway: Arc<RequestGateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &RequestGateway {
        &self.gateway
    }

    // ---------- Items ----------

    pub async fn list_items(&self) -> Result<Vec<Item>, GatewayError> {
        self.get(ITEMS_ENDPOINT).await
    }

    pub async fn create_item(&self, item: NewItem) -> Result<Receipt, GatewayError> {
        self.apply(Operation::CreateItem { item }).await
    }

    pub async fn update_item(
        &self,
        id: impl Into<String>,
        patch: ItemPatch,
    ) -> Result<Receipt, GatewayError> {
        self.apply(Operation::UpdateItem {
            id: id.into(),
            patch,
        })
        .await
    }

    pub async fn delete_item(&self, id: impl Into<String>) -> Result<Receipt, GatewayError> {
        self.apply(Operation::DeleteItem { id: id.into() }).await
    }

    // ---------- Warehouses ----------

    pub async fn list_warehouses(&self) -> Result<Vec<Warehouse>, GatewayError> {
        self.get(WAREHOUSES_ENDPOINT).await
    }

    pub async fn create_warehouse(
        &self,
        warehouse: NewWarehouse,
    ) -> Result<Receipt, GatewayError> {
        self.apply(Operation::CreateWarehouse { warehouse }).await
    }

    pub async fn update_warehouse(
        &self,
        id: impl Into<String>,
        patch: WarehousePatch,
    ) -> Result<Receipt, GatewayError> {
        self.apply(Operation::UpdateWarehouse {
            id: id.into(),
            patch,
        })
        .await
    }

    pub async fn delete_warehouse(&self, id: impl Into<String>) -> Result<Receipt, GatewayError> {
        self.apply(Operation::DeleteWarehouse { id: id.into() }).await
    }

    // ---------- Parties ----------

    pub async fn list_suppliers(&self) -> Result<Vec<Party>, GatewayError> {
        self.list_parties(PartyKind::Supplier).await
    }

    pub async fn list_customers(&self) -> Result<Vec<Party>, GatewayError> {
        self.list_parties(PartyKind::Customer).await
    }

    async fn list_parties(&self, kind: PartyKind) -> Result<Vec<Party>, GatewayError> {
        self.get(&format!("{PARTIES_ENDPOINT}?type={}", kind.as_str()))
            .await
    }

    pub async fn create_party(&self, party: NewParty) -> Result<Receipt, GatewayError> {
        self.apply(Operation::CreateParty { party }).await
    }

    pub async fn create_supplier(
        &self,
        name: impl Into<String>,
        phone: Option<String>,
    ) -> Result<Receipt, GatewayError> {
        self.create_party(NewParty {
            name: name.into(),
            kind: PartyKind::Supplier,
            phone,
        })
        .await
    }

    pub async fn create_customer(
        &self,
        name: impl Into<String>,
        phone: Option<String>,
    ) -> Result<Receipt, GatewayError> {
        self.create_party(NewParty {
            name: name.into(),
            kind: PartyKind::Customer,
            phone,
        })
        .await
    }

    // ---------- Trade ----------

    pub async fn list_purchases(&self) -> Result<Vec<Purchase>, GatewayError> {
        self.get(PURCHASES_ENDPOINT).await
    }

    pub async fn create_purchase(&self, purchase: NewPurchase) -> Result<Receipt, GatewayError> {
        self.apply(Operation::CreatePurchase { purchase }).await
    }

    pub async fn list_sales(&self) -> Result<Vec<Sale>, GatewayError> {
        self.get(SALES_ENDPOINT).await
    }

    pub async fn create_sale(&self, sale: NewSale) -> Result<Receipt, GatewayError> {
        self.apply(Operation::CreateSale { sale }).await
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, GatewayError> {
        let data = self.gateway.invoke(Request::get(endpoint)).await?.into_value();
        decode(data)
    }

    async fn apply(&self, operation: Operation) -> Result<Receipt, GatewayError> {
        let request = operation.into_request()?;
        let data = self.gateway.invoke(request).await?.into_value();
        decode(data)
    }
}

fn decode<T: DeserializeOwned>(data: serde_json::Value) -> Result<T, GatewayError> {
    serde_json::from_value(data).map_err(|e| GatewayError::Decode(e.to_string()))
}
