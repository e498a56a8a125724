//! # pmoserver - Serveur web haut niveau basé sur Axum
//!
//! Cette crate fournit une abstraction simple pour créer le serveur HTTP
//! local de PMOSpotty avec Axum. Les crates métier y greffent leurs routes
//! via des traits d'extension (`SpottyStreamingExt`, ...).
//!
//! ## Fonctionnalités
//!
//! - 🚀 **API de haut niveau** : routes JSON, handlers avec état, sous-routers
//! - 📡 **Server-Sent Events (SSE)** : logs en temps réel via `/log-sse`
//! - 🎚️ **Niveau de log dynamique** : `GET/POST /api/log_setup`
//! - ⚡ **Arrêt gracieux** : sur Ctrl+C ou via [`Server::shutdown`]
//!
//! ## Architecture
//!
//! - [`server`] : Implémentation du serveur principal et du builder
//! - [`logs`] : Système de logs (buffer circulaire, SSE, filtre rechargeable)
//!
//! ## Exemple d'utilisation
//!
//! ```rust,no_run
//! use pmoserver::ServerBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut server = ServerBuilder::new("MyServer", "127.0.0.1".parse()?, 8080).build();
//!
//!     // Ajout d'une route JSON
//!     server.add_route("/api/status", || async {
//!         serde_json::json!({"status": "ok"})
//!     }).await;
//!
//!     // Démarrage puis attente de Ctrl+C
//!     server.start().await?;
//!     server.wait().await;
//!     Ok(())
//! }
//! ```

pub mod logs;
pub mod server;

pub use logs::{LogState, LoggingOptions, SseLayer, log_dump, log_sse};
pub use server::{Server, ServerBuilder, ServerInfo};
