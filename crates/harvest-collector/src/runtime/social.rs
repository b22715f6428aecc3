//! 소셜 미디어 런타임 (Twitter, Reddit).

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use harvest_core::{CollectorSpec, Payload, Platform, PostKind, Record, SocialPost};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::warn;

use super::{
    base_url, collect_items, endpoint, record, CollectContext, CollectOutput, CollectorRuntime,
};
use crate::error::FetchError;

const TWITTER_BASE: &str = "https://api.twitter.com";
const REDDIT_BASE: &str = "https://www.reddit.com";
const TWEETS_PER_ACCOUNT: u64 = 25;
const POSTS_PER_SUBREDDIT: u64 = 25;

// ==================== Twitter ====================

/// Twitter API v2 최근 트윗 런타임.
///
/// 계정마다 `from:<account>` 검색으로 최근 트윗을 가져옵니다.
/// bearer token이 없으면 재시도해도 소용없으므로 Permanent로 실패합니다.
#[derive(Debug, Clone, Copy, Default)]
pub struct TwitterRuntime;

#[derive(Debug, Deserialize)]
struct TweetSearchResponse {
    #[serde(default)]
    data: Vec<Tweet>,
}

#[derive(Debug, Deserialize)]
struct Tweet {
    id: String,
    text: String,
    #[serde(default)]
    author_id: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    public_metrics: Option<PublicMetrics>,
}

#[derive(Debug, Deserialize)]
struct PublicMetrics {
    #[serde(default)]
    like_count: i64,
    #[serde(default)]
    reply_count: u64,
}

fn tweet_post(account: &str, tweet: Tweet) -> SocialPost {
    let url = format!("https://twitter.com/{}/status/{}", account, tweet.id);
    SocialPost {
        platform: Platform::Twitter,
        post_kind: PostKind::Tweet,
        post_id: tweet.id,
        parent_id: None,
        author: Some(tweet.author_id.unwrap_or_else(|| account.to_string())),
        channel: account.to_string(),
        title: None,
        content: tweet.text,
        score: tweet.public_metrics.as_ref().map(|m| m.like_count),
        reply_count: tweet.public_metrics.as_ref().map(|m| m.reply_count),
        url: Some(url),
        posted_at: tweet.created_at,
    }
}

#[async_trait]
impl CollectorRuntime for TwitterRuntime {
    fn name(&self) -> &'static str {
        "twitter"
    }

    async fn execute(
        &self,
        spec: &CollectorSpec,
        ctx: &CollectContext,
    ) -> Result<CollectOutput, FetchError> {
        let token = ctx
            .credentials
            .twitter_bearer_token
            .as_ref()
            .map(|t| t.expose_secret().to_string())
            .ok_or_else(|| FetchError::Permanent("twitter bearer token not configured".to_string()))?;

        let base = base_url(spec, TWITTER_BASE);
        let max_results = spec
            .parameters
            .u64("max_results")
            .unwrap_or(TWEETS_PER_ACCOUNT)
            .clamp(10, 100)
            .to_string();

        let accounts = spec.parameters.string_list("accounts");
        let items = accounts.into_iter().map(|a| {
            let account = a.trim_start_matches('@').to_string();
            (account.clone(), account)
        });

        collect_items(spec, items, |account| {
            let base = base.clone();
            let token = token.clone();
            let max_results = max_results.clone();
            async move {
                let url = endpoint(&base, &["2", "tweets", "search", "recent"])?;
                let query = format!("from:{}", account);
                let fetched = ctx
                    .http
                    .get_json::<TweetSearchResponse>(url.as_str(), |r| {
                        r.bearer_auth(&token).query(&[
                            ("query", query.as_str()),
                            ("max_results", max_results.as_str()),
                            ("tweet.fields", "created_at,public_metrics,author_id"),
                        ])
                    })
                    .await?;

                fetched
                    .body
                    .data
                    .into_iter()
                    .map(|tweet| {
                        let post = tweet_post(&account, tweet);
                        record(spec, fetched.fetched_at, Payload::SocialPost(post))
                    })
                    .collect()
            }
        })
        .await
    }
}

// ==================== Reddit ====================

/// Reddit 일간 인기 게시물 런타임.
///
/// `comment_limit` > 0이면 게시물마다 상위 댓글도 수집합니다.
/// 댓글 조회 실패는 게시물 수집을 실패시키지 않습니다.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedditRuntime;

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<Thing>,
}

#[derive(Debug, Deserialize)]
struct Thing {
    kind: String,
    data: ThingData,
}

#[derive(Debug, Deserialize)]
struct ThingData {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    selftext: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    score: Option<i64>,
    #[serde(default)]
    num_comments: Option<u64>,
    #[serde(default)]
    permalink: Option<String>,
    #[serde(default)]
    created_utc: Option<f64>,
}

fn reddit_time(created_utc: Option<f64>) -> Option<DateTime<Utc>> {
    created_utc
        .filter(|t| t.is_finite())
        .and_then(|t| Utc.timestamp_opt(t as i64, 0).single())
}

fn reddit_post(
    subreddit: &str,
    site: &str,
    kind: PostKind,
    parent_id: Option<&str>,
    data: ThingData,
) -> Option<SocialPost> {
    let post_id = data.id.filter(|id| !id.is_empty())?;
    let content = match kind {
        PostKind::Comment => data.body.unwrap_or_default(),
        _ => data.selftext.unwrap_or_default(),
    };
    Some(SocialPost {
        platform: Platform::Reddit,
        post_kind: kind,
        post_id,
        parent_id: parent_id.map(str::to_string),
        author: data.author,
        channel: subreddit.to_string(),
        title: data.title,
        content,
        score: data.score,
        reply_count: data.num_comments,
        url: data.permalink.map(|p| format!("{}{}", site, p)),
        posted_at: reddit_time(data.created_utc),
    })
}

impl RedditRuntime {
    async fn comments(
        &self,
        ctx: &CollectContext,
        base: &str,
        subreddit: &str,
        post_id: &str,
        limit: u64,
    ) -> Result<(Vec<SocialPost>, DateTime<Utc>), FetchError> {
        let url = endpoint(base, &["comments", &format!("{}.json", post_id)])?;
        let limit_param = limit.to_string();
        let fetched = ctx
            .http
            .get_json::<Vec<Listing>>(url.as_str(), |r| {
                r.query(&[("sort", "top"), ("limit", limit_param.as_str())])
            })
            .await?;

        // [0]은 게시물, [1]은 댓글 트리
        let comments = fetched
            .body
            .into_iter()
            .nth(1)
            .map(|l| l.data.children)
            .unwrap_or_default()
            .into_iter()
            .filter(|t| t.kind == "t1")
            .take(limit as usize)
            .filter_map(|t| reddit_post(subreddit, base, PostKind::Comment, Some(post_id), t.data))
            .collect();
        Ok((comments, fetched.fetched_at))
    }

    async fn collect_subreddit(
        &self,
        spec: &CollectorSpec,
        ctx: &CollectContext,
        base: &str,
        subreddit: &str,
        comment_limit: u64,
    ) -> Result<Vec<Record>, FetchError> {
        let url = endpoint(base, &["r", subreddit, "top.json"])?;
        let limit = POSTS_PER_SUBREDDIT.to_string();
        let fetched = ctx
            .http
            .get_json::<Listing>(url.as_str(), |r| r.query(&[("t", "day"), ("limit", limit.as_str())]))
            .await?;

        let posts: Vec<SocialPost> = fetched
            .body
            .data
            .children
            .into_iter()
            .filter(|t| t.kind == "t3")
            .filter_map(|t| reddit_post(subreddit, base, PostKind::Post, None, t.data))
            .collect();

        let mut records = Vec::new();
        for post in posts {
            let post_id = post.post_id.clone();
            records.push(record(spec, fetched.fetched_at, Payload::SocialPost(post))?);

            if comment_limit == 0 {
                continue;
            }
            match self.comments(ctx, base, subreddit, &post_id, comment_limit).await {
                Ok((comments, captured_at)) => {
                    for comment in comments {
                        records.push(record(spec, captured_at, Payload::SocialPost(comment))?);
                    }
                }
                Err(e) if e.escalates() => return Err(e),
                Err(e) => {
                    warn!(collector = %spec.id, post = %post_id, error = %e, "Comment fetch failed")
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl CollectorRuntime for RedditRuntime {
    fn name(&self) -> &'static str {
        "reddit"
    }

    async fn execute(
        &self,
        spec: &CollectorSpec,
        ctx: &CollectContext,
    ) -> Result<CollectOutput, FetchError> {
        let base = base_url(spec, REDDIT_BASE);
        let comment_limit = spec.parameters.u64("comment_limit").unwrap_or(0);

        let subreddits = spec.parameters.string_list("subreddits");
        let items = subreddits.into_iter().map(|s| {
            let name = s.trim_start_matches("r/").to_string();
            (name.clone(), name)
        });

        collect_items(spec, items, |subreddit| {
            let base = base.clone();
            async move {
                self.collect_subreddit(spec, ctx, &base, &subreddit, comment_limit)
                    .await
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support::{context, spec};
    use crate::runtime::Credentials;
    use harvest_core::Category;
    use mockito::Matcher;
    use secrecy::SecretString;
    use serde_json::json;

    #[tokio::test]
    async fn test_twitter_requires_token() {
        let spec = spec(
            "unstructured_data.twitter",
            Category::Twitter,
            json!({ "accounts": ["federalreserve"] }),
        );
        let err = TwitterRuntime.execute(&spec, &context()).await.unwrap_err();
        assert!(matches!(err, FetchError::Permanent(msg) if msg.contains("bearer")));
    }

    #[tokio::test]
    async fn test_twitter_recent_tweets() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/2/tweets/search/recent")
            .match_header("authorization", "Bearer tkn")
            .match_query(Matcher::UrlEncoded("query".into(), "from:federalreserve".into()))
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "data": [{
                        "id": "1750000000000000000",
                        "text": "FOMC statement released",
                        "author_id": "26784",
                        "created_at": "2024-01-31T19:00:00.000Z",
                        "public_metrics": {"like_count": 900, "reply_count": 120, "retweet_count": 300}
                    }],
                    "meta": {"result_count": 1}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let mut ctx = context();
        ctx.credentials = std::sync::Arc::new(Credentials {
            twitter_bearer_token: Some(SecretString::new("tkn".into())),
            bls_api_key: None,
        });
        let spec = spec(
            "unstructured_data.twitter",
            Category::Twitter,
            json!({ "accounts": ["@federalreserve"], "base_url": server.url() }),
        );
        let output = TwitterRuntime.execute(&spec, &ctx).await.unwrap();

        assert_eq!(output.records.len(), 1);
        let record = &output.records[0];
        assert_eq!(record.natural_key, "social_post:twitter:1750000000000000000");
        match &record.payload {
            Payload::SocialPost(p) => {
                assert_eq!(p.channel, "federalreserve");
                assert_eq!(p.score, Some(900));
                assert_eq!(p.reply_count, Some(120));
                assert!(p.posted_at.is_some());
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reddit_posts_and_comments() {
        let mut server = mockito::Server::new_async().await;
        let _top = server
            .mock("GET", "/r/wallstreetbets/top.json")
            .match_query(Matcher::Any)
            .with_header("content-type", "application/json")
            .with_body(
                json!({"kind": "Listing", "data": {"children": [
                    {"kind": "t3", "data": {
                        "id": "abc", "title": "YOLO", "selftext": "all in", "author": "u1",
                        "score": 4200, "num_comments": 2, "permalink": "/r/wallstreetbets/comments/abc/yolo/",
                        "created_utc": 1700000000.0
                    }}
                ]}})
                .to_string(),
            )
            .create_async()
            .await;
        let _comments = server
            .mock("GET", "/comments/abc.json")
            .match_query(Matcher::Any)
            .with_header("content-type", "application/json")
            .with_body(
                json!([
                    {"kind": "Listing", "data": {"children": []}},
                    {"kind": "Listing", "data": {"children": [
                        {"kind": "t1", "data": {"id": "c1", "body": "nice", "author": "u2", "score": 10}},
                        {"kind": "more", "data": {"id": "m1"}}
                    ]}}
                ])
                .to_string(),
            )
            .create_async()
            .await;

        let spec = spec(
            "unstructured_data.reddit",
            Category::Reddit,
            json!({ "subreddits": ["r/wallstreetbets"], "comment_limit": 5, "base_url": server.url() }),
        );
        let output = RedditRuntime.execute(&spec, &context()).await.unwrap();

        // 게시물 1 + 댓글 1 ("more"는 제외)
        assert_eq!(output.records.len(), 2);
        assert_eq!(output.records[0].natural_key, "social_post:reddit:abc");
        match &output.records[1].payload {
            Payload::SocialPost(p) => {
                assert_eq!(p.post_kind, PostKind::Comment);
                assert_eq!(p.parent_id.as_deref(), Some("abc"));
                assert_eq!(p.content, "nice");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
