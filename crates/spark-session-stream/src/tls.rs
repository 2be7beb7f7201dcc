use std::{fmt, sync::Arc};

use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::TlsConnector;

use crate::error::{StreamError, configure_error};

/// 客户端证书身份：证书链与对应私钥。
///
/// 会话流不解析其内容，原样交给 `rustls` 的 `with_client_auth_cert`。
pub struct ClientIdentity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl ClientIdentity {
    pub fn new(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { chain, key }
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }
}

impl Clone for ClientIdentity {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
enum TlsSource {
    Roots {
        roots: RootCertStore,
        identity: Option<ClientIdentity>,
    },
    Config(Arc<ClientConfig>),
}

/// TLS 升级设置，存在即表示会话流以 TLS 建连。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将“协商 TLS 安全级别 + 可选客户端证书”收敛为一个值对象，调用方无需直接拼装
///   `rustls::ClientConfig`；
/// - 同时保留 [`TlsSettings::from_client_config`] 逃生口，允许已有完整配置的调用方原样注入。
///
/// ## 逻辑（How）
/// - `new` 路径使用 aws-lc-rs 提供者与安全默认协议版本（TLS1.2/1.3 协商）；
/// - 若设置了 [`ClientIdentity`]，以 `with_client_auth_cert` 挂载为通道级身份材料；
/// - SNI 默认取目标主机，可通过 `with_server_name` 覆盖。
///
/// ## 契约（What）
/// - 构建发生在后台线程打开通道之前，身份材料被拒绝或 SNI 非法时经 `on_error`
///   报告一次 `spark.session_stream.configure_failed`，不会发起连接；
/// - `from_client_config` 路径忽略 `with_client_identity`，身份应已写入传入的配置。
#[derive(Clone, Debug)]
pub struct TlsSettings {
    source: TlsSource,
    server_name: Option<String>,
    alpn_protocols: Vec<Vec<u8>>,
}

impl TlsSettings {
    /// 以给定信任锚创建协商 TLS 设置。
    pub fn new(roots: RootCertStore) -> Self {
        Self {
            source: TlsSource::Roots {
                roots,
                identity: None,
            },
            server_name: None,
            alpn_protocols: Vec::new(),
        }
    }

    /// 直接使用调用方准备好的 `ClientConfig`。
    pub fn from_client_config(config: Arc<ClientConfig>) -> Self {
        Self {
            source: TlsSource::Config(config),
            server_name: None,
            alpn_protocols: Vec::new(),
        }
    }

    pub fn with_client_identity(mut self, identity: ClientIdentity) -> Self {
        if let TlsSource::Roots {
            identity: ref mut slot,
            ..
        } = self.source
        {
            *slot = Some(identity);
        }
        self
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    pub fn with_alpn_protocols(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = protocols;
        self
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn has_client_identity(&self) -> bool {
        matches!(
            self.source,
            TlsSource::Roots {
                identity: Some(_),
                ..
            }
        )
    }

    pub(crate) fn build(&self, host: &str) -> Result<TlsPlan, StreamError> {
        let config = match &self.source {
            TlsSource::Roots { roots, identity } => {
                let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
                let builder = ClientConfig::builder_with_provider(provider)
                    .with_safe_default_protocol_versions()
                    .map_err(configure_error)?
                    .with_root_certificates(roots.clone());
                let mut config = match identity {
                    Some(identity) => builder
                        .with_client_auth_cert(identity.chain.clone(), identity.key.clone_key())
                        .map_err(configure_error)?,
                    None => builder.with_no_client_auth(),
                };
                config.alpn_protocols = self.alpn_protocols.clone();
                Arc::new(config)
            }
            TlsSource::Config(config) if self.alpn_protocols.is_empty() => Arc::clone(config),
            TlsSource::Config(config) => {
                let mut config = ClientConfig::clone(config);
                config.alpn_protocols = self.alpn_protocols.clone();
                Arc::new(config)
            }
        };

        let name = self.server_name.as_deref().unwrap_or(host);
        let server_name = ServerName::try_from(name.to_owned())
            .map_err(|err| configure_error(format!("invalid server name `{name}`: {err}")))?;

        Ok(TlsPlan {
            connector: TlsConnector::from(config),
            server_name,
        })
    }
}

/// 构建完成、可直接交给事件循环的 TLS 升级计划。
#[derive(Clone)]
pub(crate) struct TlsPlan {
    pub connector: TlsConnector,
    pub server_name: ServerName<'static>,
}

impl fmt::Debug for TlsPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsPlan")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}
