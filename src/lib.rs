//! brickboard — real-time collaborative documents built from draw and text
//! bricks, served over websockets.

pub mod config;
pub mod db;
pub mod message;
pub mod routes;
pub mod services;
pub mod state;
