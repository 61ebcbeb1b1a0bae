use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::Instrument;

use super::{ErrorKind, Registry, schema};
use crate::conversation::{InvocationRequest, InvocationResult};

/// Executes the tool invocations requested by the model.
///
/// Every failure (unknown tool, invalid arguments, a failing, hanging or
/// panicking handler) becomes an error result that is fed back to the
/// model, so a single bad invocation never aborts the conversation.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    timeout: Duration,
}

impl Dispatcher {
    /// Creates a dispatcher with a per-invocation timeout.
    #[inline]
    pub fn new(registry: Arc<Registry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// Executes a single invocation.
    pub async fn dispatch(&self, request: InvocationRequest) -> InvocationResult {
        let InvocationRequest {
            id,
            tool_name,
            raw_arguments,
            unparsed_arguments,
        } = request;

        let tool = match self.registry.lookup(&tool_name) {
            Ok(tool) => tool.clone(),
            Err(_) => {
                warn!(tool = %tool_name, "tool not found");
                return InvocationResult::error(id, format!("Unknown tool: {tool_name}"));
            }
        };
        if unparsed_arguments.is_some() {
            debug!(tool = %tool_name, "arguments are not valid JSON");
            return InvocationResult::error(id, "Invalid arguments: not valid JSON");
        }
        if let Err(err) = schema::validate(tool.parameter_schema(), &raw_arguments) {
            debug!(tool = %tool_name, "invalid arguments: {err}");
            return InvocationResult::error(id, format!("Invalid arguments: {err}"));
        }

        trace!("spawning a tool ({id}) with args: {raw_arguments:?}");
        let span = debug_span!("tool execute", tool = %tool_name, id = %id);
        let mut handle = tokio::spawn(tool.execute(raw_arguments).instrument(span));

        match timeout(self.timeout, &mut handle).await {
            Ok(Ok(Ok(content))) => InvocationResult::success(id, content),
            Ok(Ok(Err(err))) => {
                debug!(tool = %tool_name, "tool failed: {err}");
                let content = match err.kind() {
                    ErrorKind::InvalidInput => format!("Invalid arguments: {}", err.reason()),
                    ErrorKind::ExecutionError => {
                        format!("Tool execution failed: {}", err.reason())
                    }
                };
                InvocationResult::error(id, content)
            }
            Ok(Err(join_err)) => {
                // The panic payload stays in the logs.
                error!(tool = %tool_name, "tool crashed: {join_err}");
                InvocationResult::error(id, "Tool crashed")
            }
            Err(_) => {
                handle.abort();
                warn!(tool = %tool_name, "tool timed out");
                InvocationResult::error(
                    id,
                    format!("Tool timed out after {:?}", self.timeout),
                )
            }
        }
    }

    /// Executes a batch of invocations concurrently.
    ///
    /// Results are returned in request order, regardless of which
    /// invocation finishes first.
    pub async fn dispatch_all(
        &self,
        requests: &[InvocationRequest],
    ) -> Vec<InvocationResult> {
        let span = debug_span!("tool batch", size = requests.len());
        async {
            let mut tasks = JoinSet::new();
            for (idx, request) in requests.iter().enumerate() {
                let dispatcher = self.clone();
                let request = request.clone();
                tasks.spawn(async move { (idx, dispatcher.dispatch(request).await) });
            }

            let mut results: Vec<Option<InvocationResult>> = vec![None; requests.len()];
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((idx, result)) => results[idx] = Some(result),
                    Err(err) => error!("dispatch task failed: {err}"),
                }
            }

            results
                .into_iter()
                .zip(requests)
                .map(|(result, request)| {
                    result.unwrap_or_else(|| {
                        InvocationResult::error(request.id.clone(), "Tool crashed")
                    })
                })
                .collect()
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::future::{pending, ready};

    use serde_json::{Value, json};
    use tokio::time::sleep;

    use super::*;
    use crate::conversation::InvocationStatus;
    use crate::tool::{Error, FnTool, Tool, ToolResult};

    struct GetWeather;

    #[derive(serde::Deserialize)]
    struct GetWeatherInput {
        location: String,
    }

    impl Tool for GetWeather {
        type Input = GetWeatherInput;

        fn name(&self) -> &str {
            "get_weather"
        }

        fn description(&self) -> &str {
            "Gets the current weather of a location."
        }

        fn parameter_schema(&self) -> &Value {
            static SCHEMA: std::sync::LazyLock<Value> = std::sync::LazyLock::new(|| {
                json!({
                    "type": "object",
                    "properties": { "location": { "type": "string" } },
                    "required": ["location"]
                })
            });
            &SCHEMA
        }

        fn execute(
            &self,
            input: Self::Input,
        ) -> impl Future<Output = ToolResult> + Send + 'static {
            async move {
                // Slower for the first city, so completion order differs.
                if input.location == "Pittsburgh" {
                    sleep(Duration::from_millis(50)).await;
                }
                Ok(format!("Sunny in {}", input.location))
            }
        }
    }

    fn request(id: &str, tool_name: &str, args: Value) -> InvocationRequest {
        InvocationRequest {
            id: id.to_owned(),
            tool_name: tool_name.to_owned(),
            raw_arguments: args,
            unparsed_arguments: None,
        }
    }

    fn dispatcher() -> Dispatcher {
        let registry = Registry::builder()
            .register(GetWeather)
            .unwrap()
            .register(FnTool::new("fail", "Always fails.", json!({}), |_| {
                ready(Err::<String, _>(
                    Error::execution_error().with_reason("service is down"),
                ))
            }))
            .unwrap()
            .register(FnTool::new("hang", "Never finishes.", json!({}), |_| async {
                pending::<()>().await;
                Ok::<_, Error>(String::new())
            }))
            .unwrap()
            .register(FnTool::new("crash", "Panics.", json!({}), |input: Value| async move {
                if input.is_object() {
                    panic!("secret internal state");
                }
                Ok::<_, Error>(String::new())
            }))
            .unwrap()
            .build();
        Dispatcher::new(registry, Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_keeps_request_order() {
        let results = dispatcher()
            .dispatch_all(&[
                request("1", "get_weather", json!({ "location": "Pittsburgh" })),
                request("2", "get_weather", json!({ "location": "Boston" })),
            ])
            .await;
        assert_eq!(
            results,
            vec![
                InvocationResult::success("1", "Sunny in Pittsburgh"),
                InvocationResult::success("2", "Sunny in Boston"),
            ]
        );
    }

    #[tokio::test]
    async fn test_rejected_invocations() {
        let dispatcher = dispatcher();

        let result = dispatcher.dispatch(request("1", "foo", json!({}))).await;
        assert_eq!(result, InvocationResult::error("1", "Unknown tool: foo"));

        let result = dispatcher.dispatch(request("2", "get_weather", json!({}))).await;
        assert_eq!(
            result,
            InvocationResult::error("2", "Invalid arguments: $.location: missing required property")
        );

        let mut unparsed = request("3", "get_weather", Value::Null);
        unparsed.unparsed_arguments = Some("{\"location\":".to_owned());
        let result = dispatcher.dispatch(unparsed).await;
        assert_eq!(
            result,
            InvocationResult::error("3", "Invalid arguments: not valid JSON")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_handlers() {
        let results = dispatcher()
            .dispatch_all(&[
                request("1", "fail", json!({})),
                request("2", "hang", json!({})),
                request("3", "crash", json!({})),
            ])
            .await;
        assert!(results.iter().all(|r| r.status == InvocationStatus::Error));
        assert_eq!(results[0].content, "Tool execution failed: service is down");
        assert_eq!(results[1].content, "Tool timed out after 30s");
        assert_eq!(results[2].content, "Tool crashed");
        assert!(!results[2].content.contains("secret"));
    }
}
