//! HTTP/WebSocket接口层
//!
//! REST负责控制面（启停源、查询统计），/ws/video推送检测流。

pub mod handlers;
pub mod routes;
pub mod ws;

pub use routes::create_router;
