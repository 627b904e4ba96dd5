use std::{fmt, sync::Arc};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    machine::RequestMachine,
    options::{notify, resolve_options},
    request::prepare_body,
    FetchError, FetchOptions, Input, Result, Transport,
};

/// Computes caller-level defaults for one call from the input, the call
/// options and the call context.
pub type DefaultOptionsFn<C> =
    Arc<dyn Fn(&Input, &FetchOptions, Option<&C>) -> FetchOptions + Send + Sync>;

enum Defaults<C> {
    Static(FetchOptions),
    Dynamic(DefaultOptionsFn<C>),
}

impl<C> Clone for Defaults<C> {
    fn clone(&self) -> Self {
        match self {
            Self::Static(options) => Self::Static(options.clone()),
            Self::Dynamic(resolve) => Self::Dynamic(resolve.clone()),
        }
    }
}

/// Request orchestrator in front of a [`Transport`].
///
/// Every call merges built-in fallbacks, the fetcher's defaults and the call
/// options, then drives one request through the retry loop.
pub struct Fetcher<T: Transport> {
    transport: Arc<T>,
    defaults: Defaults<T::Context>,
}

impl<T: Transport> Clone for Fetcher<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            defaults: self.defaults.clone(),
        }
    }
}

impl<T: Transport + fmt::Debug> fmt::Debug for Fetcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Fetcher");
        debug.field("transport", &self.transport);
        match &self.defaults {
            Defaults::Static(options) => debug.field("defaults", options),
            Defaults::Dynamic(_) => debug.field("defaults", &"<dynamic>"),
        };
        debug.finish()
    }
}

impl<T: Transport> Fetcher<T> {
    /// Creates a fetcher with no caller-level defaults.
    pub fn new(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
            defaults: Defaults::Static(FetchOptions::default()),
        }
    }

    /// Sets defaults applied to every call.
    pub fn with_defaults(mut self, defaults: FetchOptions) -> Self {
        self.defaults = Defaults::Static(defaults);
        self
    }

    /// Computes defaults per call, e.g. to pick a base URL per tenant.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use fetchline::{FetchOptions, Fetcher, ReqwestTransport};
    ///
    /// let fetcher = Fetcher::new(ReqwestTransport::new()).with_default_options(
    ///     |_input, call: &FetchOptions, _ctx| {
    ///         let base = if call.method.is_some() { "https://write.test" } else { "https://read.test" };
    ///         FetchOptions::new().base_url(base)
    ///     },
    /// );
    /// ```
    pub fn with_default_options<F>(mut self, resolve: F) -> Self
    where
        F: Fn(&Input, &FetchOptions, Option<&T::Context>) -> FetchOptions + Send + Sync + 'static,
    {
        self.defaults = Defaults::Dynamic(Arc::new(resolve));
        self
    }

    /// Runs one call and returns the validated data.
    pub async fn execute(&self, input: impl Into<Input>, options: FetchOptions) -> Result<Value> {
        self.run(input.into(), options, None).await
    }

    /// Like [`Fetcher::execute`], threading `ctx` to the defaults resolver
    /// and the transport.
    pub async fn execute_with_context(
        &self,
        input: impl Into<Input>,
        options: FetchOptions,
        ctx: &T::Context,
    ) -> Result<Value> {
        self.run(input.into(), options, Some(ctx)).await
    }

    /// Runs one call and deserializes the validated data into `D`.
    ///
    /// Decoding happens after `on_success` fired; a mismatch is reported as
    /// [`FetchError::Parse`].
    pub async fn execute_as<D: DeserializeOwned>(
        &self,
        input: impl Into<Input>,
        options: FetchOptions,
    ) -> Result<D> {
        let input = input.into();
        let completed = self.run_machine(input, options, None).await?;
        serde_json::from_value(completed.data).map_err(|err| FetchError::Parse {
            source: Box::new(err),
            request: completed.request,
        })
    }

    async fn run(
        &self,
        input: Input,
        options: FetchOptions,
        ctx: Option<&T::Context>,
    ) -> Result<Value> {
        self.run_machine(input, options, ctx)
            .await
            .map(|completed| completed.data)
    }

    async fn run_machine(
        &self,
        input: Input,
        call: FetchOptions,
        ctx: Option<&T::Context>,
    ) -> Result<crate::machine::Completed> {
        let defaults = match &self.defaults {
            Defaults::Static(options) => options.clone(),
            Defaults::Dynamic(resolve) => resolve(&input, &call, ctx),
        };

        let mut merged = resolve_options(&defaults, &call);
        let body = match prepare_body(&mut merged) {
            Ok(body) => body,
            Err(err) => {
                if let Some(on_error) = &merged.on.on_error {
                    notify("on_error", || on_error(&err, None));
                }
                return Err(err);
            }
        };

        RequestMachine::new(self.transport.as_ref(), input, merged, body, ctx)
            .run()
            .await
    }
}
