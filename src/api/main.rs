use actix_cors::Cors;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use anyhow::Context;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

use parkwise::models::RecommendationCriteria;
use parkwise::recommendations;
use parkwise::stop_index::StopIndex;
use parkwise::store::PgObservationStore;

/// Upstream clients send postcodes as either a JSON string or a number.
#[derive(Deserialize)]
#[serde(untagged)]
enum PostcodeField {
    Text(String),
    Number(i64),
}

impl PostcodeField {
    fn into_string(self) -> String {
        match self {
            PostcodeField::Text(text) => text,
            PostcodeField::Number(number) => number.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct RecommendRequest {
    day: Option<String>,
    time: Option<String>,
    postcode: Option<PostcodeField>,
}

async fn index() -> impl Responder {
    HttpResponse::Ok()
        .insert_header(("Content-Type", "text/plain"))
        .body("API is running. Try POST /api/recommend")
}

#[actix_web::get("/health")]
async fn health(store: web::Data<Arc<PgObservationStore>>) -> impl Responder {
    match store.ping().await {
        Ok(()) => HttpResponse::Ok().json(json!({ "ok": true })),
        Err(err) => {
            error!("store health check failed: {err}");
            HttpResponse::InternalServerError().json(json!({ "ok": false }))
        }
    }
}

#[actix_web::post("/api/recommend")]
async fn recommend(
    store: web::Data<Arc<PgObservationStore>>,
    stop_index: web::Data<Arc<StopIndex>>,
    body: web::Json<RecommendRequest>,
) -> impl Responder {
    let request = body.into_inner();
    if request.day.is_none() || request.postcode.is_none() {
        return HttpResponse::BadRequest().json(json!({ "error": "Missing fields: day/postcode" }));
    }

    let criteria = RecommendationCriteria {
        day: request.day,
        time: request.time,
        postcode: request.postcode.map(PostcodeField::into_string),
    };

    match recommendations::recommend(
        store.get_ref().as_ref(),
        stop_index.get_ref().as_ref(),
        &criteria,
    )
    .await
    {
        Ok(results) => HttpResponse::Ok().json(json!({ "results": results })),
        Err(err) => {
            error!("recommendation query failed: {err}");
            HttpResponse::InternalServerError().json(json!({ "error": "Server error" }))
        }
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let stops_path =
        std::env::var("STOPS_GEOJSON_PATH").context("STOPS_GEOJSON_PATH must be set")?;
    let bind_addr =
        std::env::var("BIND_ADDR").unwrap_or_else(|_| String::from("127.0.0.1:17432"));
    let worker_amount = std::env::var("WORKER_AMOUNT")
        .unwrap_or_else(|_| String::from("2"))
        .parse::<usize>()
        .context("WORKER_AMOUNT must be a number")?;

    // The index must exist before any request is served; a bad stop dataset
    // aborts startup instead of surfacing per request.
    let stop_index = Arc::new(StopIndex::from_geojson_file(&stops_path)?);
    info!("loaded {} transit stops from {}", stop_index.len(), stops_path);

    let store = Arc::new(PgObservationStore::connect(&database_url).await?);

    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(web::Data::new(Arc::clone(&store)))
            .app_data(web::Data::new(Arc::clone(&stop_index)))
            .route("/", web::get().to(index))
            .service(health)
            .service(recommend)
    })
    .workers(worker_amount)
    .bind(bind_addr.as_str())?
    .run()
    .await?;

    Ok(())
}
