//! 俱乐部模块与角色权限注册表
//! 模块目录、模块实例、角色授权与 HTTP 接口

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod repository;
pub mod routes;
pub mod services;
pub mod telemetry;
