//! Request handling shared by the one-shot commands and the `serve` loop.
//!
//! `serve` reads one JSON request per line and writes one JSON response per
//! line, in order, against a single long-lived [`ValidationService`]. The
//! latency window and worker pool therefore persist across requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use visual_ai::{FramePair, HealingRequest, ProviderId, RequestSettings, RouteRequest, TaskType};

use crate::capture::{load_frame, load_frames};
use crate::error::{CliError, CliResult};
use crate::service::ValidationService;

/// One pair of a batch, as image sources.
#[derive(Debug, Clone, Deserialize)]
pub struct PairEntry {
    #[serde(default)]
    pub pair_id: Option<String>,
    pub baseline: String,
    pub actual: String,
}

impl PairEntry {
    pub fn load(self) -> CliResult<FramePair> {
        let pair = FramePair::new(load_frame(&self.baseline)?, load_frame(&self.actual)?);
        Ok(match self.pair_id {
            Some(id) => pair.with_id(id),
            None => pair,
        })
    }
}

fn one() -> usize {
    1
}

/// A request, tagged by `op`. Images are paths or `data:` URIs.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Compare {
        baseline: String,
        actual: String,
        #[serde(default)]
        model: Option<ProviderId>,
        #[serde(default)]
        settings: RequestSettings,
    },
    CompareSequences {
        first: Vec<String>,
        second: Vec<String>,
        #[serde(default)]
        model: Option<ProviderId>,
        #[serde(default)]
        settings: RequestSettings,
    },
    Stability {
        frames: Vec<String>,
        #[serde(default)]
        settings: RequestSettings,
    },
    Heal {
        frames: Vec<String>,
        #[serde(default)]
        expected: Option<String>,
        #[serde(default)]
        high_accuracy: bool,
        #[serde(default)]
        settings: RequestSettings,
    },
    Find {
        image: String,
        description: String,
        #[serde(default)]
        model: Option<ProviderId>,
        #[serde(default)]
        settings: RequestSettings,
    },
    Describe {
        image: String,
        description: String,
        #[serde(default)]
        model: Option<ProviderId>,
    },
    Embed {
        image: String,
        #[serde(default)]
        model: Option<ProviderId>,
    },
    Batch {
        pairs: Vec<PairEntry>,
        #[serde(default)]
        model: Option<ProviderId>,
        #[serde(default)]
        settings: RequestSettings,
    },
    Change {
        before: String,
        after: String,
        #[serde(default)]
        action: Option<String>,
        #[serde(default)]
        settings: RequestSettings,
    },
    Health,
    Route {
        task: TaskType,
        #[serde(default)]
        model: Option<ProviderId>,
        #[serde(default = "one")]
        frames: usize,
        #[serde(default)]
        high_accuracy: bool,
    },
}

/// Error payload printed for a failed request.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

impl From<&CliError> for ErrorBody {
    fn from(e: &CliError) -> Self {
        Self {
            error: e.kind(),
            message: e.to_string(),
        }
    }
}

/// One line of `serve` output.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Value, error: &CliError) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Serve one request and return its verdict as JSON.
pub async fn dispatch(service: &ValidationService, request: Request) -> CliResult<Value> {
    let value = match request {
        Request::Compare {
            baseline,
            actual,
            model,
            settings,
        } => {
            let (a, b) = (load_frame(&baseline)?, load_frame(&actual)?);
            let verdict = service
                .run(move |o| o.compare(&a, &b, model, &settings))
                .await?;
            serde_json::to_value(verdict)?
        }

        Request::CompareSequences {
            first,
            second,
            model,
            settings,
        } => {
            let (a, b) = (load_frames(&first)?, load_frames(&second)?);
            let verdict = service
                .run(move |o| o.compare_sequences(&a, &b, model, &settings))
                .await?;
            serde_json::to_value(verdict)?
        }

        Request::Stability { frames, settings } => {
            let frames = load_frames(&frames)?;
            let verdict = service
                .run(move |o| o.detect_stability(&frames, &settings))
                .await?;
            serde_json::to_value(verdict)?
        }

        Request::Heal {
            frames,
            expected,
            high_accuracy,
            settings,
        } => {
            let frames = load_frames(&frames)?;
            let expected = expected.map(|e| load_frame(&e)).transpose()?;
            let request = HealingRequest::from_sequence(frames, expected.map(|f| vec![f]))?
                .high_accuracy(high_accuracy);
            let verdict = service
                .run(move |o| o.validate_healing(&request, &settings))
                .await?;
            serde_json::to_value(verdict)?
        }

        Request::Find {
            image,
            description,
            model,
            settings,
        } => {
            let frame = load_frame(&image)?;
            let found = service
                .run(move |o| o.find_by_description(&frame, &description, model, &settings))
                .await?;
            serde_json::to_value(found)?
        }

        Request::Describe {
            image,
            description,
            model,
        } => {
            let frame = load_frame(&image)?;
            let verdict = service
                .run(move |o| o.compare_with_description(&frame, &description, model))
                .await?;
            serde_json::to_value(verdict)?
        }

        Request::Embed { image, model } => {
            let frame = load_frame(&image)?;
            let output = service
                .run(move |o| o.generate_embedding(&frame, model))
                .await?;
            serde_json::to_value(output)?
        }

        Request::Batch {
            pairs,
            model,
            settings,
        } => {
            let pairs = pairs
                .into_iter()
                .map(PairEntry::load)
                .collect::<CliResult<Vec<_>>>()?;
            serde_json::to_value(service.batch_compare(pairs, model, settings).await?)?
        }

        Request::Change {
            before,
            after,
            action,
            settings,
        } => {
            let (a, b) = (load_frame(&before)?, load_frame(&after)?);
            let analysis = service
                .run(move |o| o.analyze_change(&a, &b, action.as_deref(), &settings))
                .await?;
            serde_json::to_value(analysis)?
        }

        Request::Health => serde_json::to_value(service.orchestrator().health())?,

        Request::Route {
            task,
            model,
            frames,
            high_accuracy,
        } => {
            let router = service.orchestrator().router();
            let req = RouteRequest::new(task)
                .with_override(model)
                .with_frames(frames)
                .high_accuracy(high_accuracy);
            serde_json::json!({
                "decision": router.route(&req)?,
                "explanation": router.explain(task),
            })
        }
    };
    Ok(value)
}

async fn handle_line(service: &ValidationService, line: &str) -> Response {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return Response::failure(Value::Null, &CliError::from(e)),
    };
    let id = value.get("id").cloned().unwrap_or(Value::Null);

    let result = match serde_json::from_value::<Request>(value) {
        Ok(request) => dispatch(service, request).await,
        Err(e) => Err(CliError::from(e)),
    };

    match result {
        Ok(result) => Response::success(id, result),
        Err(e) => {
            tracing::warn!("Request {id} failed: {e}");
            Response::failure(id, &e)
        }
    }
}

/// Answer line-delimited requests from `reader` until EOF.
///
/// Returns the number of requests answered.
pub async fn serve<R, W>(service: &ValidationService, reader: R, mut writer: W) -> CliResult<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tracing::info!("Serving line-delimited JSON requests");
    let mut lines = reader.lines();
    let mut handled = 0;

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = handle_line(service, trimmed).await;
        let mut framed = serde_json::to_string(&response)?;
        framed.push('\n');
        writer.write_all(framed.as_bytes()).await?;
        writer.flush().await?;
        handled += 1;
    }

    tracing::info!("EOF on input, shutting down after {handled} request(s)");
    Ok(handled)
}
