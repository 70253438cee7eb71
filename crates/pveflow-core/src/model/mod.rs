//! モデル定義
//!
//! 入力設定（未検証）、検証済みトポロジー、調停用リソースを機能ごとに分離しています。

mod environment;
mod network;
mod node;
mod resource;

// Re-exports
pub use environment::*;
pub use network::*;
pub use node::*;
pub use resource::*;
