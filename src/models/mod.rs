//! 数据模型模块
//! 模块目录、俱乐部模块实例、模块化角色

pub mod instance;
pub mod module;
pub mod role;

pub use instance::*;
pub use module::*;
pub use role::*;
