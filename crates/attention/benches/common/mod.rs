use std::{fs, path::Path};

use candle_core::{DType, Device, Tensor};

/// Problem size of one bench row.
#[derive(Debug, Clone, Copy)]
pub struct Case {
    pub batch: usize,
    pub heads: usize,
    pub q_len: usize,
    pub k_len: usize,
    pub head_dim: usize,
    pub dtype: DType,
    pub causal: bool,
}

impl Case {
    pub fn describe(&self) -> String {
        format!(
            "({},{},{},{},{}){}",
            self.batch,
            self.heads,
            self.q_len,
            self.k_len,
            self.head_dim,
            if self.causal { " causal" } else { "" }
        )
    }
}

/// Standard normal `q`, `k`, `v` and `do` for `case`.
pub fn build_inputs(case: &Case) -> candle_core::Result<(Tensor, Tensor, Tensor, Tensor)> {
    let device = Device::Cpu;
    let q_shape = (case.batch, case.heads, case.q_len, case.head_dim);
    let k_shape = (case.batch, case.heads, case.k_len, case.head_dim);
    let q = Tensor::randn(0.0f32, 1.0, q_shape, &device)?.to_dtype(case.dtype)?;
    let k = Tensor::randn(0.0f32, 1.0, k_shape, &device)?.to_dtype(case.dtype)?;
    let v = Tensor::randn(0.0f32, 1.0, k_shape, &device)?.to_dtype(case.dtype)?;
    let d_o = Tensor::randn(0.0f32, 1.0, q_shape, &device)?.to_dtype(case.dtype)?;
    Ok((q, k, v, d_o))
}

/// Render `rows` under `headers` as a markdown table.
pub fn format_markdown_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    fn line(cells: &[String]) -> String {
        format!("| {} |\n", cells.join(" | "))
    }

    let header: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    let rule = vec!["---".to_string(); headers.len()];
    let mut table = line(&header) + &line(&rule);
    for row in rows {
        table.push_str(&line(row));
    }
    table
}

const RESULTS_PATH: &str = "crates/attention/benchmarks/RESULTS.md";

/// Replace the `section` block of the results file, appending it on first run.
pub fn update_results(section: &str, content: &str) -> std::io::Result<()> {
    let tag = section.to_uppercase();
    let (start, end) = (format!("<!-- {tag}_START -->"), format!("<!-- {tag}_END -->"));
    let block = format!("{start}\n{content}\n{end}\n");

    let path = Path::new(RESULTS_PATH);
    let mut body = match fs::read_to_string(path) {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => "# Flash Attention Benchmarks\n\n".to_string(),
        Err(err) => return Err(err),
    };

    match (body.find(&start), body.find(&end)) {
        (Some(from), Some(to)) if from < to => {
            let stop = (to + end.len() + 1).min(body.len());
            body.replace_range(from..stop, &block);
        }
        _ => {
            if !body.ends_with('\n') {
                body.push('\n');
            }
            body.push_str(&block);
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, body)
}
