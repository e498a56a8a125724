//! # Module Server - API de haut niveau pour Axum
//!
//! Ce module fournit une abstraction simple pour créer des serveurs HTTP
//! avec Axum, en cachant la configuration du routage et du cycle de vie.
//!
//! ## Fonctionnalités
//!
//! - 🚀 **Routes JSON simples** : Ajoutez des endpoints API avec `add_route()`
//! - 🎯 **Handlers personnalisés** : Support SSE, streaming, etc. avec `add_handler_with_state()`
//! - 🔀 **Sous-routers** : Greffez un `Router` complet avec `add_router()`
//! - ⚡ **Gestion gracieuse** : Arrêt propre sur Ctrl+C ou `shutdown()`

use crate::logs::{LogState, LoggingOptions, create_logs_router, init_logging, log_dump, log_sse};
use axum::handler::Handler;
use axum::routing::{get, post};
use axum::{Json, Router};
use pmoconfig::get_config;
use serde::Serialize;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::{
    signal,
    sync::{Notify, RwLock},
    task::JoinHandle,
};
use tracing::{error, info};

/// Info serveur sérialisable
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub base_url: String,
    pub http_port: u16,
}

/// Serveur principal
pub struct Server {
    name: String,
    bind_address: IpAddr,
    http_port: u16,
    router: Arc<RwLock<Router>>,
    join_handle: Option<JoinHandle<()>>,
    shutdown: Arc<Notify>,
    local_addr: Option<SocketAddr>,
    log_state: Option<LogState>,
}

impl Server {
    /// Crée une nouvelle instance de serveur
    ///
    /// # Arguments
    ///
    /// * `name` - Nom du serveur (pour les logs)
    /// * `bind_address` - Adresse d'écoute
    /// * `http_port` - Port HTTP à écouter (`0` pour un port éphémère)
    ///
    /// # Exemple
    ///
    /// ```rust
    /// # use pmoserver::Server;
    /// let server = Server::new("MyAPI", "127.0.0.1".parse().unwrap(), 3000);
    /// ```
    pub fn new(name: impl Into<String>, bind_address: IpAddr, http_port: u16) -> Self {
        Self {
            name: name.into(),
            bind_address,
            http_port,
            router: Arc::new(RwLock::new(Router::new())),
            join_handle: None,
            shutdown: Arc::new(Notify::new()),
            local_addr: None,
            log_state: None,
        }
    }

    pub fn new_configured() -> Self {
        let config = get_config();
        Self::new(
            "PMOSpotty-Server",
            config.get_bind_address(),
            config.get_http_port(),
        )
    }

    /// Ajoute une route JSON dynamique
    ///
    /// Crée un endpoint qui retourne du JSON. La closure fournie sera appelée
    /// à chaque requête GET sur le chemin spécifié.
    ///
    /// # Exemple
    ///
    /// ```rust,no_run
    /// # use pmoserver::Server;
    /// # #[tokio::main]
    /// # async fn main() {
    /// # let mut server = Server::new("Test", "127.0.0.1".parse().unwrap(), 3000);
    /// server.add_route("/api/status", || async {
    ///     serde_json::json!({
    ///         "status": "online",
    ///         "version": "1.0.0"
    ///     })
    /// }).await;
    /// # }
    /// ```
    pub async fn add_route<F, Fut, T>(&mut self, path: &str, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let f = Arc::new(f);
        let handler = {
            let f = f.clone();
            move || {
                let f = f.clone();
                async move { Json(f().await) }
            }
        };

        let route = Router::new().route("/", get(handler));
        self.mount(path, route).await;
    }

    /// Ajoute un handler Axum standard
    pub async fn add_handler<H, T>(&mut self, path: &str, handler: H)
    where
        H: Handler<T, ()> + Clone + 'static,
        T: 'static,
    {
        let route = Router::new().route("/", get(handler.clone()));
        self.mount(path, route).await;
    }

    /// Ajoute un handler POST avec état
    pub async fn add_post_handler_with_state<H, T, S>(&mut self, path: &str, handler: H, state: S)
    where
        H: Handler<T, S> + Clone + 'static,
        T: 'static,
        S: Clone + Send + Sync + 'static,
    {
        let route = Router::new()
            .route("/", post(handler.clone()))
            .with_state(state.clone());
        self.mount(path, route).await;
    }

    /// Ajoute un handler avec état
    pub async fn add_handler_with_state<H, T, S>(&mut self, path: &str, handler: H, state: S)
    where
        H: Handler<T, S> + Clone + 'static,
        T: 'static,
        S: Clone + Send + Sync + 'static,
    {
        let route = Router::new()
            .route("/", get(handler.clone()))
            .with_state(state.clone());
        self.mount(path, route).await;
    }

    /// Ajoute un sous-router au serveur
    ///
    /// - Si `path` est "/", merge directement au router principal
    /// - Sinon, nest le router sous le chemin donné
    pub async fn add_router(&mut self, path: &str, sub_router: Router) {
        let normalized = format!("/{}", path.trim_start_matches('/'));
        self.mount(&normalized, sub_router).await;
    }

    async fn mount(&mut self, path: &str, route: Router) {
        let mut r = self.router.write().await;
        *r = if path == "/" {
            std::mem::take(&mut *r).merge(route)
        } else {
            std::mem::take(&mut *r).nest(path, route)
        };
    }

    /// Copie du router courant (utile pour les tests avec `oneshot`)
    pub async fn router(&self) -> Router {
        self.router.read().await.clone()
    }

    /// Démarre le serveur HTTP
    ///
    /// Lie le socket d'écoute (l'erreur de bind est remontée à l'appelant),
    /// lance le service en tâche de fond et met en place la gestion de
    /// Ctrl+C pour un arrêt gracieux.
    ///
    /// # Exemple
    ///
    /// ```rust,no_run
    /// # use pmoserver::Server;
    /// # #[tokio::main]
    /// # async fn main() -> std::io::Result<()> {
    /// # let mut server = Server::new("Test", "127.0.0.1".parse().unwrap(), 3000);
    /// server.start().await?;
    /// server.wait().await;  // Attend Ctrl+C
    /// # Ok(())
    /// # }
    /// ```
    pub async fn start(&mut self) -> std::io::Result<SocketAddr> {
        let addr = SocketAddr::new(self.bind_address, self.http_port);
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                let port = self.http_port;
                let message = tokio::task::spawn_blocking(move || {
                    pmoutils::describe_port_conflict(port, pmoutils::Transport::Tcp)
                })
                .await
                .unwrap_or_else(|_| format!("TCP port {} is already in use", port));
                error!("❌ {}", message);
                return Err(std::io::Error::new(std::io::ErrorKind::AddrInUse, message));
            }
            Err(e) => return Err(e),
        };
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        info!("🌐 Server {} running at http://{}", self.name, local_addr);

        let router = self.router.read().await.clone();
        let shutdown = self.shutdown.clone();
        let server_task = tokio::spawn(async move {
            let result = axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(async move { shutdown.notified().await })
                .await;
            if let Err(e) = result {
                error!("❌ HTTP server error: {}", e);
            }
        });

        let shutdown = self.shutdown.clone();
        let shutdown_task = tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Ctrl+C reçu, arrêt gracieux");
            }
            shutdown.notify_one();
        });

        self.join_handle = Some(tokio::spawn(async move {
            tokio::select! {
                _ = server_task => {},
                _ = shutdown_task => {},
            }
        }));

        Ok(local_addr)
    }

    /// Attend la fin du serveur (Ctrl+C ou [`Server::shutdown`])
    pub async fn wait(&mut self) {
        if let Some(h) = self.join_handle.take() {
            let _ = h.await;
        }
    }

    /// Demande l'arrêt gracieux du serveur
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Récupère les infos du serveur
    pub fn info(&self) -> ServerInfo {
        let port = self
            .local_addr
            .map(|a| a.port())
            .unwrap_or(self.http_port);
        let host = if self.bind_address.is_unspecified() {
            "localhost".to_string()
        } else {
            self.bind_address.to_string()
        };
        ServerInfo {
            name: self.name.clone(),
            base_url: format!("http://{}:{}", host, port),
            http_port: port,
        }
    }

    /// État des logs, si [`Server::init_logging`] a été appelé
    pub fn log_state(&self) -> Option<&LogState> {
        self.log_state.as_ref()
    }

    /// Initialise le système de logging et enregistre les routes de logs
    ///
    /// Cette méthode configure le système de tracing avec SSE et optionnellement la console,
    /// puis enregistre automatiquement les routes `/log-sse`, `/log-dump` et
    /// `/api/log_setup`.
    ///
    /// # Exemple
    ///
    /// ```rust,no_run
    /// # use pmoserver::{ServerBuilder, logs::LoggingOptions};
    /// # #[tokio::main]
    /// # async fn main() {
    /// let mut server = ServerBuilder::new_configured().build();
    /// server.init_logging(LoggingOptions::from_config()).await;
    /// # }
    /// ```
    pub async fn init_logging(&mut self, options: LoggingOptions) {
        let log_state = init_logging(options);

        // Enregistrer automatiquement les routes de logging
        self.add_handler_with_state("/log-sse", log_sse, log_state.clone())
            .await;
        self.add_handler_with_state("/log-dump", log_dump, log_state.clone())
            .await;
        self.add_router("/api", create_logs_router(log_state.clone()))
            .await;

        self.log_state = Some(log_state);
    }
}

/// Builder pattern
pub struct ServerBuilder {
    name: String,
    bind_address: IpAddr,
    http_port: u16,
}

impl ServerBuilder {
    /// Crée un nouveau builder
    ///
    /// # Arguments
    ///
    /// * `name` - Nom du serveur
    /// * `bind_address` - Adresse d'écoute
    /// * `http_port` - Port HTTP
    pub fn new(name: impl Into<String>, bind_address: IpAddr, http_port: u16) -> Self {
        Self {
            name: name.into(),
            bind_address,
            http_port,
        }
    }

    pub fn new_configured() -> Self {
        let config = get_config();
        Self {
            name: "PMOSpotty-Server".to_string(),
            bind_address: config.get_bind_address(),
            http_port: config.get_http_port(),
        }
    }

    /// Construit le serveur
    ///
    /// Consomme le builder et retourne une instance de `Server` prête à l'emploi.
    pub fn build(self) -> Server {
        Server::new(self.name, self.bind_address, self.http_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_add_route_serves_json() {
        let mut server = Server::new("Test", localhost(), 0);
        server
            .add_route("/api/status", || async { serde_json::json!({"status": "ok"}) })
            .await;

        let response = server
            .router()
            .await
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn test_start_binds_ephemeral_port_and_shuts_down() {
        let mut server = Server::new("Test", localhost(), 0);
        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.info().http_port, addr.port());

        server.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), server.wait())
            .await
            .expect("server did not stop");
    }
}
