#![doc = include_str!("../README.md")]

use anyhow::bail;
use clap::Parser;
use crackhash_core::types::CrackRequest;

#[derive(Parser, Debug)]
#[command(
    name = "crackhash-curl",
    version,
    about = "Prints the curl command that submits the MD5 of a word for cracking"
)]
struct CliArgs {
    /// Word to hash.
    #[arg(long)]
    word: String,

    /// Longest candidate the manager should try. Defaults to the word's
    /// length.
    #[arg(long)]
    max_length: Option<u32>,

    /// Base URL of the manager.
    ///
    /// Environment variable: `MANAGER_URL`
    #[arg(long, env = "MANAGER_URL", default_value_t = String::from("http://localhost:8080"))]
    manager_url: String,
}

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let word = args.word.trim();
    if word.is_empty() {
        bail!("word must not be empty");
    }

    let request = crack_request(word, args.max_length)?;
    println!("MD5({word:?}) = {}", request.hash);
    println!("{}", curl_command(&request, &args.manager_url)?);
    Ok(())
}

fn crack_request(word: &str, max_length: Option<u32>) -> anyhow::Result<CrackRequest> {
    let max_length = match max_length {
        Some(n) => n,
        None => u32::try_from(word.chars().count())?,
    };
    Ok(CrackRequest {
        hash: format!("{:x}", md5::compute(word)),
        max_length,
    })
}

fn curl_command(request: &CrackRequest, manager_url: &str) -> anyhow::Result<String> {
    let body = serde_json::to_string(request)?;
    Ok(format!(
        "curl -X POST -H \"Content-Type: application/json\" -d '{body}' {}/api/hash/crack",
        manager_url.trim_end_matches('/')
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_length_defaults_to_word_length() {
        let request = crack_request("ab", None).unwrap();
        assert_eq!(request.hash, "187ef4436122d1cc2f40dc2b92f0eba0");
        assert_eq!(request.max_length, 2);
        assert_eq!(crack_request("ab", Some(5)).unwrap().max_length, 5);
    }

    #[test]
    fn command_posts_camel_case_body() {
        let request = crack_request("a", None).unwrap();
        let command = curl_command(&request, "http://localhost:8080/").unwrap();
        assert_eq!(
            command,
            "curl -X POST -H \"Content-Type: application/json\" \
             -d '{\"hash\":\"0cc175b9c0f1b6a831c399e269772661\",\"maxLength\":1}' \
             http://localhost:8080/api/hash/crack"
        );
    }
}
