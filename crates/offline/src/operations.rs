//! Typed mutations of the trade API.
//!
//! Each [`Operation`] knows its verb, endpoint and JSON body, so callers never
//! build paths or payloads by hand. Validation here is structural only;
//! business rules stay with the server.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tradeflow_core::{DomainError, DomainResult, Verb};

use crate::types::{Request, is_placeholder_id};

pub const ITEMS_ENDPOINT: &str = "/api/items";
pub const WAREHOUSES_ENDPOINT: &str = "/api/warehouses";
pub const PARTIES_ENDPOINT: &str = "/api/parties";
pub const PURCHASES_ENDPOINT: &str = "/api/purchases";
pub const SALES_ENDPOINT: &str = "/api/sales";

/// Stock-keeping unit of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Kg,
    Pcs,
    Crate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewItem {
    pub name: String,
    pub sku: String,
    pub unit: Unit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_stock: Option<f64>,
}

/// Partial update; absent fields are left untouched by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<Unit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_stock: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWarehouse {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehousePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PartyKind {
    Supplier,
    Customer,
}

impl PartyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartyKind::Supplier => "SUPPLIER",
            PartyKind::Customer => "CUSTOMER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewParty {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PartyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// Goods received into a warehouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseLine {
    pub item_id: String,
    pub warehouse_id: String,
    pub qty: f64,
    pub unit_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount: Option<f64>,
}

/// Goods shipped out of a warehouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleLine {
    pub item_id: String,
    pub warehouse_id: String,
    pub qty: f64,
    pub unit_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPurchase {
    pub supplier_id: String,
    pub date: NaiveDate,
    pub lines: Vec<PurchaseLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSale {
    pub customer_id: String,
    pub date: NaiveDate,
    pub lines: Vec<SaleLine>,
}

/// A mutation of the trade API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    CreateItem { item: NewItem },
    UpdateItem { id: String, patch: ItemPatch },
    DeleteItem { id: String },
    CreateWarehouse { warehouse: NewWarehouse },
    UpdateWarehouse { id: String, patch: WarehousePatch },
    DeleteWarehouse { id: String },
    CreateParty { party: NewParty },
    CreatePurchase { purchase: NewPurchase },
    CreateSale { sale: NewSale },
}

impl Operation {
    pub fn verb(&self) -> Verb {
        match self {
            Operation::CreateItem { .. }
            | Operation::CreateWarehouse { .. }
            | Operation::CreateParty { .. }
            | Operation::CreatePurchase { .. }
            | Operation::CreateSale { .. } => Verb::Post,
            Operation::UpdateItem { .. } | Operation::UpdateWarehouse { .. } => Verb::Patch,
            Operation::DeleteItem { .. } | Operation::DeleteWarehouse { .. } => Verb::Delete,
        }
    }

    pub fn endpoint(&self) -> String {
        match self {
            Operation::CreateItem { .. } => ITEMS_ENDPOINT.to_string(),
            Operation::UpdateItem { id, .. } | Operation::DeleteItem { id } => {
                format!("{ITEMS_ENDPOINT}/{id}")
            }
            Operation::CreateWarehouse { .. } => WAREHOUSES_ENDPOINT.to_string(),
            Operation::UpdateWarehouse { id, .. } | Operation::DeleteWarehouse { id } => {
                format!("{WAREHOUSES_ENDPOINT}/{id}")
            }
            Operation::CreateParty { .. } => PARTIES_ENDPOINT.to_string(),
            Operation::CreatePurchase { .. } => PURCHASES_ENDPOINT.to_string(),
            Operation::CreateSale { .. } => SALES_ENDPOINT.to_string(),
        }
    }

    /// Request body; deletes carry none.
    pub fn body(&self) -> DomainResult<Option<Value>> {
        let value = match self {
            Operation::CreateItem { item } => serde_json::to_value(item),
            Operation::UpdateItem { patch, .. } => serde_json::to_value(patch),
            Operation::CreateWarehouse { warehouse } => serde_json::to_value(warehouse),
            Operation::UpdateWarehouse { patch, .. } => serde_json::to_value(patch),
            Operation::CreateParty { party } => serde_json::to_value(party),
            Operation::CreatePurchase { purchase } => serde_json::to_value(purchase),
            Operation::CreateSale { sale } => serde_json::to_value(sale),
            Operation::DeleteItem { .. } | Operation::DeleteWarehouse { .. } => return Ok(None),
        };
        value
            .map(Some)
            .map_err(|e| DomainError::validation(format!("cannot encode payload: {e}")))
    }

    pub fn validate(&self) -> DomainResult<()> {
        match self {
            Operation::CreateItem { item } => {
                require("name", &item.name)?;
                require("sku", &item.sku)?;
                non_negative("minStock", item.min_stock)
            }
            Operation::UpdateItem { id, patch } => {
                record_id("item", id)?;
                if let Some(name) = &patch.name {
                    require("name", name)?;
                }
                if let Some(sku) = &patch.sku {
                    require("sku", sku)?;
                }
                non_negative("minStock", patch.min_stock)
            }
            Operation::DeleteItem { id } => record_id("item", id),
            Operation::CreateWarehouse { warehouse } => require("name", &warehouse.name),
            Operation::UpdateWarehouse { id, patch } => {
                record_id("warehouse", id)?;
                match &patch.name {
                    Some(name) => require("name", name),
                    None => Ok(()),
                }
            }
            Operation::DeleteWarehouse { id } => record_id("warehouse", id),
            Operation::CreateParty { party } => require("name", &party.name),
            Operation::CreatePurchase { purchase } => {
                require("supplierId", &purchase.supplier_id)?;
                if purchase.lines.is_empty() {
                    return Err(DomainError::validation("purchase needs at least one line"));
                }
                for line in &purchase.lines {
                    line_refs(&line.item_id, &line.warehouse_id)?;
                    positive("qty", line.qty)?;
                    non_negative("unitCost", Some(line.unit_cost))?;
                    adjustments(line.tax, line.discount)?;
                }
                Ok(())
            }
            Operation::CreateSale { sale } => {
                require("customerId", &sale.customer_id)?;
                if sale.lines.is_empty() {
                    return Err(DomainError::validation("sale needs at least one line"));
                }
                for line in &sale.lines {
                    line_refs(&line.item_id, &line.warehouse_id)?;
                    positive("qty", line.qty)?;
                    non_negative("unitPrice", Some(line.unit_price))?;
                    adjustments(line.tax, line.discount)?;
                }
                Ok(())
            }
        }
    }

    /// Validate and turn into a gateway request.
    pub fn into_request(self) -> DomainResult<Request> {
        self.validate()?;
        let mut request = Request::new(self.endpoint(), self.verb());
        request.payload = self.body()?;
        Ok(request)
    }
}

fn require(field: &str, value: &str) -> DomainResult<()> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("{field} cannot be empty")));
    }
    Ok(())
}

/// Characters that would change the resolved URL instead of naming a record.
const PATH_UNSAFE: &[char] = &['/', '\\', '?', '#', '%'];

/// Path ids must be single literal segments and server ids: a placeholder
/// would never resolve on replay.
fn record_id(what: &str, id: &str) -> DomainResult<()> {
    let malformed = id.trim().is_empty()
        || id == "."
        || id == ".."
        || id.contains(PATH_UNSAFE)
        || id.chars().any(char::is_control);
    if malformed {
        return Err(DomainError::validation(format!("invalid {what} id '{id}'")));
    }
    if is_placeholder_id(id) {
        return Err(DomainError::validation(format!(
            "{what} '{id}' has not been synced yet"
        )));
    }
    Ok(())
}

fn line_refs(item_id: &str, warehouse_id: &str) -> DomainResult<()> {
    require("itemId", item_id)?;
    require("warehouseId", warehouse_id)
}

fn positive(field: &str, value: f64) -> DomainResult<()> {
    if !(value.is_finite() && value > 0.0) {
        return Err(DomainError::validation(format!("{field} must be positive")));
    }
    Ok(())
}

fn non_negative(field: &str, value: Option<f64>) -> DomainResult<()> {
    match value {
        Some(v) if !(v.is_finite() && v >= 0.0) => Err(DomainError::validation(format!(
            "{field} must not be negative"
        ))),
        _ => Ok(()),
    }
}

fn adjustments(tax: Option<f64>, discount: Option<f64>) -> DomainResult<()> {
    non_negative("tax", tax)?;
    non_negative("discount", discount)
}
