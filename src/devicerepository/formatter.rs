use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::lpp::CayenneLpp;
use super::{MessagePayloadFormatter, PayloadFormatter};
use crate::utils::GsError;

/// A ready-to-run formatter.
pub trait Formatter: Send + Sync {
    fn decode(&self, f_port: u32, payload: &[u8]) -> Result<Value, GsError>;

    fn encode(&self, data: &Value) -> Result<Vec<u8>, GsError>;
}

/// A payload formatter language.
///
/// Compilable providers turn the formatter parameter into a [`Formatter`] once;
/// the others interpret the parameter on every message.
pub trait FormatterProvider: Send + Sync {
    fn compilable(&self) -> bool {
        false
    }

    fn compile(&self, _parameter: &str) -> Result<Arc<dyn Formatter>, GsError> {
        Err(GsError::Unimplemented("formatter is not compilable".into()))
    }

    fn decode(&self, parameter: &str, f_port: u32, payload: &[u8]) -> Result<Value, GsError>;

    fn encode(&self, parameter: &str, data: &Value) -> Result<Vec<u8>, GsError>;
}

/// A cached codec: compiled once, or a provider re-applying its parameter.
#[derive(Clone)]
pub enum Codec {
    Compiled(Arc<dyn Formatter>),
    Interpreted {
        provider: Arc<dyn FormatterProvider>,
        parameter: Arc<str>,
    },
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::Compiled(_) => f.write_str("Codec::Compiled"),
            Codec::Interpreted { parameter, .. } => f
                .debug_struct("Codec::Interpreted")
                .field("parameter", parameter)
                .finish(),
        }
    }
}

impl Codec {
    pub fn decode(&self, f_port: u32, payload: &[u8]) -> Result<Value, GsError> {
        match self {
            Codec::Compiled(formatter) => formatter.decode(f_port, payload),
            Codec::Interpreted {
                provider,
                parameter,
            } => provider.decode(parameter, f_port, payload),
        }
    }

    pub fn encode(&self, data: &Value) -> Result<Vec<u8>, GsError> {
        match self {
            Codec::Compiled(formatter) => formatter.encode(data),
            Codec::Interpreted {
                provider,
                parameter,
            } => provider.encode(parameter, data),
        }
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self, Codec::Compiled(_))
    }
}

/// The formatter languages this server can run.
#[derive(Clone, Default)]
pub struct Providers {
    providers: HashMap<PayloadFormatter, Arc<dyn FormatterProvider>>,
}

impl Providers {
    /// The native providers: CayenneLPP.
    pub fn with_defaults() -> Self {
        let mut providers = Self::default();
        providers.register(PayloadFormatter::CayenneLpp, Arc::new(CayenneLpp));
        providers
    }

    pub fn register(&mut self, kind: PayloadFormatter, provider: Arc<dyn FormatterProvider>) {
        self.providers.insert(kind, provider);
    }

    /// Builds the codec of a formatter returned by the repository.
    ///
    /// # Errors
    ///
    /// * `NotFound` when the repository has no formatter for the model.
    /// * `Unimplemented` for languages without provider.
    /// * Any compilation error of the provider.
    pub fn codec(&self, formatter: &MessagePayloadFormatter) -> Result<Codec, GsError> {
        let kind = PayloadFormatter::try_from(formatter.formatter)
            .map_err(|_| GsError::InvalidArgument(format!("unknown formatter {}", formatter.formatter)))?;
        if kind == PayloadFormatter::None {
            return Err(GsError::NotFound("payload formatter".into()));
        }
        let provider = self
            .providers
            .get(&kind)
            .ok_or_else(|| GsError::Unimplemented(format!("{:?} payload formatters", kind)))?;
        if provider.compilable() {
            Ok(Codec::Compiled(provider.compile(&formatter.formatter_parameter)?))
        } else {
            Ok(Codec::Interpreted {
                provider: Arc::clone(provider),
                parameter: formatter.formatter_parameter.as_str().into(),
            })
        }
    }
}
