use async_trait::async_trait;
use switchyard_core::elicitation::FormPrompter;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines, Stdin, Stdout};
use tokio::sync::Mutex;

/// Line-oriented terminal I/O shared by the chat loop and elicitation forms.
///
/// One reader serves both so a form opened mid-exchange never races the chat
/// prompt for input.
pub struct LinePrompter<R, W> {
    io: Mutex<(Lines<R>, W)>,
}

impl LinePrompter<BufReader<Stdin>, Stdout> {
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> LinePrompter<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            io: Mutex::new((reader.lines(), writer)),
        }
    }
}

#[async_trait]
impl<R, W> FormPrompter for LinePrompter<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn ask(&self, prompt: &str) -> Option<String> {
        let mut io = self.io.lock().await;
        let (lines, out) = &mut *io;
        if out.write_all(prompt.as_bytes()).await.is_err() || out.flush().await.is_err() {
            return None;
        }
        match lines.next_line().await {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read input");
                None
            }
        }
    }

    async fn show(&self, text: &str) {
        let mut io = self.io.lock().await;
        let out = &mut io.1;
        let _ = out.write_all(format!("{}\n", text).as_bytes()).await;
        let _ = out.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use switchyard_core::elicitation::{run_dialogue, ElicitationOutcome};

    #[derive(Deserialize)]
    struct Answers {
        city: String,
        nights: i64,
    }

    #[tokio::test]
    async fn test_reads_lines_until_eof() {
        let prompter = LinePrompter::new(&b"first\nsecond\n"[..], Vec::new());
        assert_eq!(prompter.ask("> ").await.as_deref(), Some("first"));
        assert_eq!(prompter.ask("> ").await.as_deref(), Some("second"));
        assert_eq!(prompter.ask("> ").await, None);

        let io = prompter.io.into_inner();
        assert_eq!(io.1, b"> > > ".to_vec());
    }

    #[tokio::test]
    async fn test_drives_an_elicitation_form() {
        let prompter = LinePrompter::new(&b"y\nLisbon\ntwo\n3\n"[..], Vec::new());
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "city": {"type": "string"},
                "nights": {"type": "integer"}
            },
            "required": ["city", "nights"]
        });

        let outcome = run_dialogue("Book a stay", &schema, &prompter).await.unwrap();
        let ElicitationOutcome::Accept(answers) = outcome else {
            panic!("expected accept");
        };
        let answers: Answers = serde_json::from_value(serde_json::Value::Object(answers)).unwrap();
        assert_eq!(answers.city, "Lisbon");
        assert_eq!(answers.nights, 3);
    }
}
