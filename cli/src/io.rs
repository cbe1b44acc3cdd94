use eyre::{Result, WrapErr};
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader, BufWriter};

pub type Input = Box<dyn AsyncBufRead + Unpin + Send>;
pub type Output = Box<dyn AsyncWrite + Unpin + Send>;

/// Opens `name` for reading; "stdin" and "-" read standard input.
pub async fn open_input(name: &str) -> Result<Input> {
    let input: Input = match name {
        "stdin" | "-" => Box::new(BufReader::new(tokio::io::stdin())),
        _ => {
            let f = File::open(name)
                .await
                .wrap_err_with(|| format!("opening {}", name))?;
            Box::new(BufReader::new(f))
        }
    };
    Ok(input)
}

/// Creates `name` for writing; "stdout" and "-" write standard output.
pub async fn create_output(name: &str) -> Result<Output> {
    let output: Output = match name {
        "stdout" | "-" => Box::new(BufWriter::new(tokio::io::stdout())),
        _ => {
            let f = File::create(name)
                .await
                .wrap_err_with(|| format!("creating {}", name))?;
            Box::new(BufWriter::new(f))
        }
    };
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use envsample::{Codec, JsonCodec, Observation};
    use std::time::{Duration, SystemTime};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn file_round_trip() {
        let path = std::env::temp_dir().join(format!("envsample-io-{}.ndjson", std::process::id()));
        let name = path.to_str().unwrap();
        let obs = Observation::new(SystemTime::UNIX_EPOCH + Duration::from_secs(60))
            .with_field("temperature", 21.5);

        let mut output = create_output(name).await.unwrap();
        JsonCodec.encode(&mut output, &obs).await.unwrap();
        output.flush().await.unwrap();
        drop(output);

        let mut input = open_input(name).await.unwrap();
        let decoded = JsonCodec.decode(&mut input).await.unwrap();
        assert_eq!(decoded.value("temperature"), Some(21.5));
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn missing_input_names_the_file() {
        let err = match open_input("/nonexistent/envsample.ndjson").await {
            Ok(_) => panic!("opened a missing file"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("/nonexistent/envsample.ndjson"));
    }
}
