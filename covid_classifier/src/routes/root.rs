use axum::{response::IntoResponse, response::Json};
use serde::{Deserialize, Serialize};

const WELCOME_MESSAGE: &str = "Welcome to the COVID-19 Classification API!";

#[derive(Serialize, Deserialize)]
pub struct Welcome {
    message: String,
}

pub async fn root() -> impl IntoResponse {
    Json(Welcome {
        message: WELCOME_MESSAGE.into(),
    })
}
