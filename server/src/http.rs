//! HTTP surface.
//!
//! `GET /:resource` runs a query (where / include / limit as URL-encoded
//! JSON query parameters, with string-`"null"` normalization applied at
//! every depth); `POST /:resource/:procedure` executes a mutation.
//! Anything else is NOT_FOUND.

use crate::context::RawRequest;
use crate::error::{AppError, Result};
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tether_engine::{
    normalize_query_nulls, CustomCall, EncodedField, IncludeClause, Mutation, MutationMeta,
    QueryRequest, Record, RecordId, WhereClause, WriteMutation,
};

/// Create the HTTP routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/{resource}", get(query_handler).fallback(fallback_handler))
        .route(
            "/{resource}/{procedure}",
            post(mutate_handler).fallback(fallback_handler),
        )
        .fallback(fallback_handler)
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    connections: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        connections: state.registry.connection_count(),
    })
}

/// GET /:resource?where=..&include=..&limit=..
async fn query_handler(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<BTreeMap<RecordId, Record>>> {
    let filter = params.get("where").map(|raw| parse_where(raw)).transpose()?;
    let include = params
        .get("include")
        .map(|raw| parse_include(raw))
        .transpose()?;
    let limit = params
        .get("limit")
        .map(|raw| {
            raw.parse::<usize>()
                .map_err(|_| AppError::InvalidRequest("limit must be a non-negative integer".to_string()))
        })
        .transpose()?;

    let request = QueryRequest {
        resource,
        filter,
        include,
        limit,
    };
    let data = state
        .server
        .handle_query(request, RawRequest::from_headers(&headers))
        .await?;
    Ok(Json(data))
}

/// Body of POST /:resource/:procedure.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MutateBody {
    resource_id: Option<String>,
    payload: Option<BTreeMap<String, EncodedField>>,
    meta: Option<MutationMeta>,
    input: Option<Value>,
}

/// Response of a mutation: `{ data, acceptedValues }`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MutateResponse {
    data: Value,
    accepted_values: Option<BTreeMap<String, tether_engine::FieldValue>>,
}

async fn mutate_handler(
    State(state): State<AppState>,
    Path((resource, procedure)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<MutateBody>,
) -> Result<Json<MutateResponse>> {
    let mutation = match procedure.as_str() {
        "INSERT" | "UPDATE" => {
            let resource_id = body
                .resource_id
                .ok_or_else(|| AppError::InvalidRequest("resourceId is required".to_string()))?;
            let payload = body
                .payload
                .ok_or_else(|| AppError::InvalidRequest("payload is required".to_string()))?;
            let meta = body
                .meta
                .ok_or_else(|| AppError::InvalidRequest("meta.timestamp is required".to_string()))?;
            let write = WriteMutation {
                resource,
                resource_id,
                payload,
                meta,
            };
            if procedure == "INSERT" {
                Mutation::Insert(write)
            } else {
                Mutation::Update(write)
            }
        }
        _ => Mutation::Custom(CustomCall {
            resource,
            resource_id: body.resource_id,
            procedure,
            input: body.input.unwrap_or(Value::Null),
        }),
    };

    let response = state
        .execute_mutation(mutation, RawRequest::from_headers(&headers), None)
        .await?;
    Ok(Json(MutateResponse {
        data: response.data.to_value(),
        accepted_values: response.accepted_values,
    }))
}

/// Unsupported methods and paths are NOT_FOUND.
async fn fallback_handler() -> AppError {
    AppError::NotFound("unsupported route".to_string())
}

fn parse_where(raw: &str) -> Result<WhereClause> {
    let value: Value = serde_json::from_str(raw).map_err(|error| {
        AppError::Engine(tether_engine::Error::InvalidQuery(format!(
            "where must be JSON: {error}"
        )))
    })?;
    let value = normalize_query_nulls(value);
    WhereClause::parse(&value).map_err(Into::into)
}

fn parse_include(raw: &str) -> Result<IncludeClause> {
    let value: Value = serde_json::from_str(raw).map_err(|error| {
        AppError::Engine(tether_engine::Error::InvalidQuery(format!(
            "include must be JSON: {error}"
        )))
    })?;
    // sub-query where-clauses normalize too
    let value = normalize_query_nulls(value);
    serde_json::from_value(value).map_err(|error| {
        AppError::Engine(tether_engine::Error::InvalidQuery(format!(
            "invalid include: {error}"
        )))
    })
}
