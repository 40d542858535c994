use crate::{
    config::{Config, ServerConfig},
    inference_service::InferenceService,
    model_service::ModelService,
    ort_service::OrtModelService,
    routes::api_routes,
};
use axum::{extract::DefaultBodyLimit, Router};
use std::sync::Arc;
use tokio::{net::TcpListener, signal};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

pub struct SharedState<M: ModelService> {
    pub inference_service: Arc<InferenceService<M>>,
}

impl<M: ModelService> Clone for SharedState<M> {
    fn clone(&self) -> Self {
        Self {
            inference_service: self.inference_service.clone(),
        }
    }
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new<M: ModelService>(
        model_service: Option<M>,
        config: &ServerConfig,
    ) -> anyhow::Result<Self> {
        let router = build_router(model_service, config);
        let listener = TcpListener::bind(config.get_address()).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(
            "Classification service listening on {}",
            self.listener.local_addr()?
        );

        let shutdown = async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown")
        };

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

pub fn build_router<M: ModelService>(model_service: Option<M>, config: &ServerConfig) -> Router {
    let app_state = SharedState {
        inference_service: Arc::new(InferenceService::new(model_service)),
    };

    let body_limit = match config.max_upload_bytes {
        Some(limit) => DefaultBodyLimit::max(limit),
        None => DefaultBodyLimit::disable(),
    };

    Router::new()
        .merge(api_routes())
        .with_state(app_state)
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
}

/// Any origin, method and header with credentials. A wildcard is not allowed
/// together with credentials, so the request values are echoed back.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

pub async fn start_server(config: Config) -> anyhow::Result<()> {
    tracing::info!("Loading model from {}", config.model.get_path().display());
    let model_service = OrtModelService::load(&config.model);
    match &model_service {
        Some(service) => tracing::info!("Model loaded from {}", service.model_path().display()),
        None => tracing::warn!("Serving without a model, /predict will fail until restart"),
    }

    let server = HttpServer::new(model_service, &config.server).await?;
    server.run().await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_service::ModelError;
    use axum::{
        body::Body,
        http::{header, Method, Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use image::{ImageBuffer, ImageFormat, Rgba};
    use ndarray::{Array, Ix4};
    use serde_json::{json, Value};
    use std::io::Cursor;
    use tower::ServiceExt;

    const BOUNDARY: &str = "XRAYBOUNDARY";

    struct MockModelService {
        probability: f32,
    }

    impl ModelService for MockModelService {
        fn predict(&self, _input: &Array<f32, Ix4>) -> Result<f32, ModelError> {
            Ok(self.probability)
        }
    }

    struct FailingModelService;

    impl ModelService for FailingModelService {
        fn predict(&self, _input: &Array<f32, Ix4>) -> Result<f32, ModelError> {
            Err(ModelError::EmptyOutput)
        }
    }

    fn server_config(max_upload_bytes: Option<usize>) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_upload_bytes,
        }
    }

    fn router<M: ModelService>(model_service: Option<M>) -> Router {
        build_router(model_service, &server_config(None))
    }

    fn png_bytes() -> Vec<u8> {
        let img = ImageBuffer::<Rgba<u8>, Vec<u8>>::from_pixel(300, 200, Rgba([80, 80, 80, 255]));
        let mut image_data: Vec<u8> = Vec::new();
        img.write_to(&mut Cursor::new(&mut image_data), ImageFormat::Png)
            .unwrap();
        image_data
    }

    fn multipart_body(field: &str, filename: &str, data: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn predict_request(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/predict")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_root_without_model() {
        let app = router::<MockModelService>(None);

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({ "message": "Welcome to the COVID-19 Classification API!" })
        );
    }

    #[tokio::test]
    async fn test_predict_covid() {
        let app = router(Some(MockModelService { probability: 0.2 }));

        let response = app
            .oneshot(predict_request(multipart_body("file", "xray.png", &png_bytes())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["filename"], "xray.png");
        assert_eq!(body["predicted_class"], "covid");
        assert!((body["confidence"].as_f64().unwrap() - 0.8).abs() < 1e-6);
        assert_eq!(body["probabilities"], json!({ "covid": 80.0, "normal": 20.0 }));
    }

    #[tokio::test]
    async fn test_predict_normal() {
        let app = router(Some(MockModelService { probability: 0.9 }));

        let response = app
            .oneshot(predict_request(multipart_body("file", "xray.jpg", &png_bytes())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["predicted_class"], "normal");
        assert!((body["confidence"].as_f64().unwrap() - 0.9).abs() < 1e-6);
        assert_eq!(body["probabilities"], json!({ "covid": 10.0, "normal": 90.0 }));
    }

    #[tokio::test]
    async fn test_predict_without_model() {
        for body in [
            multipart_body("file", "xray.png", &png_bytes()),
            multipart_body("file", "notes.png", b"plain text"),
            b"not even multipart".to_vec(),
        ] {
            let app = router::<MockModelService>(None);
            let response = app.oneshot(predict_request(body)).await.unwrap();

            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(json_body(response).await, json!({ "detail": "Model not loaded" }));
        }
    }

    #[tokio::test]
    async fn test_predict_text_file_with_image_extension() {
        let app = router(Some(MockModelService { probability: 0.9 }));

        let response = app
            .oneshot(predict_request(multipart_body(
                "file",
                "xray.png",
                b"this is a text file",
            )))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        let detail = body["detail"].as_str().unwrap();
        assert!(detail.starts_with("Error processing image: "), "{}", detail);
    }

    #[tokio::test]
    async fn test_predict_inference_failure_is_client_error() {
        let app = router(Some(FailingModelService));

        let response = app
            .oneshot(predict_request(multipart_body("file", "xray.png", &png_bytes())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await,
            json!({ "detail": "Error during prediction: model returned an empty output" })
        );
    }

    #[tokio::test]
    async fn test_predict_missing_file_field() {
        let app = router(Some(MockModelService { probability: 0.9 }));

        let response = app
            .oneshot(predict_request(multipart_body("image", "xray.png", &png_bytes())))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            json_body(response).await,
            json!({ "detail": "Field required: file" })
        );
    }

    #[tokio::test]
    async fn test_predict_malformed_upload_with_model() {
        let octet_stream = Request::builder()
            .method(Method::POST)
            .uri("/predict")
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(png_bytes()))
            .unwrap();

        for request in [predict_request(b"not even multipart".to_vec()), octet_stream] {
            let app = router(Some(MockModelService { probability: 0.9 }));
            let response = app.oneshot(request).await.unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body = json_body(response).await;
            let detail = body["detail"].as_str().unwrap();
            assert!(detail.starts_with("Error processing image: "), "{}", detail);
        }
    }

    #[tokio::test]
    async fn test_predict_part_without_filename() {
        let app = router(Some(MockModelService { probability: 0.9 }));

        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(&png_bytes());
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        let response = app.oneshot(predict_request(body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["filename"], Value::Null);
        assert_eq!(body["predicted_class"], "normal");
    }

    #[tokio::test]
    async fn test_predict_upload_limit() {
        let app = build_router(
            Some(MockModelService { probability: 0.9 }),
            &server_config(Some(64)),
        );

        let response = app
            .oneshot(predict_request(multipart_body("file", "xray.png", &png_bytes())))
            .await
            .unwrap();

        assert!(response.status().is_client_error());
        let body = json_body(response).await;
        assert!(body["detail"]
            .as_str()
            .unwrap()
            .starts_with("Error processing image: "));
    }

    #[tokio::test]
    async fn test_cors_preflight_mirrors_origin() {
        let app = router::<MockModelService>(None);

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/predict")
                    .header(header::ORIGIN, "http://frontend.example")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "x-custom")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let headers = response.headers();
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://frontend.example"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], "POST");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], "x-custom");
    }
}
