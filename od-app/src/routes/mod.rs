pub mod channels;
pub mod health;
pub mod messages;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(channels::router())
        .merge(messages::router())
}
