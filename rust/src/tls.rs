use std::sync::Once;

static INIT: Once = Once::new();

/// reqwest and tokio-tungstenite can pull in different rustls crypto backends; pin ring
/// before either opens a connection.
pub(crate) fn init_rustls_crypto_provider() {
    INIT.call_once(|| {
        // Err means a provider is already installed, which is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
