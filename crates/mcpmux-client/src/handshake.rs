//! The `initialize` exchange.
//!
//! Version selection walks the preferred list newest-first until the server
//! accepts one, unless a quirk pins (`forceProtocolVersion`) or bypasses
//! (`skipNegotiation`) the walk. The caller wraps this whole routine in the
//! configured handshake timeout.

use mcpmux_protocol::{
    ClientCapabilities, FeatureSet, InitializeRequestParams, InitializeResult, NegotiatedProtocol,
    PROTOCOL_VERSIONS, methods, supports_version, version::latest_version,
};
use tracing::{debug, warn};

use crate::client::{ClientConfig, UpstreamClient};
use crate::error::ClientError;

pub(crate) async fn negotiate(
    client: &UpstreamClient,
    config: &ClientConfig,
) -> Result<NegotiatedProtocol, ClientError> {
    let quirks = &config.quirks;
    let attempts: Vec<String> = if let Some(forced) = &quirks.force_protocol_version {
        vec![forced.clone()]
    } else if quirks.skip_negotiation {
        vec![latest_version().to_string()]
    } else {
        PROTOCOL_VERSIONS.iter().map(|v| (*v).to_string()).collect()
    };

    let mut last_error: Option<ClientError> = None;
    for version in &attempts {
        let params = InitializeRequestParams {
            protocol_version: version.clone(),
            capabilities: ClientCapabilities::default(),
            client_info: config.client_info.clone(),
        };
        let params = serde_json::to_value(params)
            .map_err(|e| ClientError::Protocol(e.to_string()))?;

        match client.request_unchecked(methods::INITIALIZE, Some(params)).await {
            Err(error @ ClientError::Transport(_)) => {
                // A dead transport will not accept the next version either.
                return Err(error);
            }
            Err(error) => {
                debug!(server = %config.server_id, %version, %error, "version rejected");
                last_error = Some(error);
            }
            Ok(value) => {
                let init: InitializeResult = serde_json::from_value(value).map_err(|e| {
                    ClientError::Protocol(format!("malformed initialize result: {e}"))
                })?;

                let accepted = if let Some(forced) = &quirks.force_protocol_version {
                    // Pinned version must come back verbatim.
                    init.protocol_version == *forced
                } else if quirks.skip_negotiation {
                    true
                } else {
                    // Echo, or a counter-proposal the hub also speaks.
                    init.protocol_version == *version
                        || supports_version(&init.protocol_version)
                };
                if !accepted {
                    warn!(
                        server = %config.server_id,
                        offered = %version,
                        answered = %init.protocol_version,
                        "server answered with an unsupported protocol version"
                    );
                    last_error = Some(ClientError::Handshake(format!(
                        "server insists on unsupported protocol version {}",
                        init.protocol_version
                    )));
                    continue;
                }

                client.notify(methods::INITIALIZED, None).await?;

                let mut features = FeatureSet::from_capabilities(&init.capabilities);
                if let Some(assumed) = quirks.assumed_features {
                    features = features.union(assumed);
                }
                debug!(
                    server = %config.server_id,
                    version = %init.protocol_version,
                    upstream = %init.server_info.name,
                    ?features,
                    "handshake complete"
                );
                return Ok(NegotiatedProtocol {
                    version: init.protocol_version,
                    server_info: init.server_info,
                    features,
                    raw_capabilities: init.capabilities,
                });
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| ClientError::Handshake("no protocol version accepted".to_string())))
}
