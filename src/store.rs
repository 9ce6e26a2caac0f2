//! Message store: the durable side of the system. All ids are UUIDv7
//! strings, all timestamps RFC 3339 text. Queries are runtime-checked
//! sqlx against SQLite.

use serde::Serialize;
use sqlx::SqlitePool;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    profile_picture TEXT,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    user1_id TEXT NOT NULL,
    user2_id TEXT NOT NULL,
    last_message TEXT,
    last_message_time TEXT
);
CREATE TABLE IF NOT EXISTS one_to_one_messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS communities (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS memberships (
    id TEXT PRIMARY KEY,
    community_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    is_admin INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE (community_id, user_id)
);
CREATE TABLE IF NOT EXISTS community_messages (
    id TEXT PRIMARY KEY,
    community_id TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS replies (
    id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// Idempotent schema bootstrap; also what in-memory test pools run.
pub async fn init_db(pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

/// Server-assigned timestamp, RFC 3339 UTC.
pub fn now_iso() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

fn new_id() -> String {
    Uuid::now_v7().to_string()
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub profile_picture: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Conversation {
    pub id: String,
    pub user1_id: String,
    pub user2_id: String,
    pub last_message: Option<String>,
    pub last_message_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct OneToOneMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Community {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Membership {
    pub id: String,
    pub community_id: String,
    pub user_id: String,
    pub is_admin: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CommunityMessage {
    pub id: String,
    pub community_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Reply {
    pub id: String,
    pub message_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: String,
}

pub async fn create_user(
    pool: &SqlitePool,
    email: &str,
    name: &str,
    profile_picture: Option<&str>,
) -> sqlx::Result<User> {
    let user = User {
        id: new_id(),
        email: email.to_owned(),
        name: name.to_owned(),
        profile_picture: profile_picture.map(str::to_owned),
        created_at: now_iso(),
    };
    sqlx::query("INSERT INTO users (id,email,name,profile_picture,created_at) VALUES (?,?,?,?,?)")
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.name)
        .bind(&user.profile_picture)
        .bind(&user.created_at)
        .execute(pool)
        .await?;
    Ok(user)
}

pub async fn get_user(pool: &SqlitePool, user_id: &str) -> sqlx::Result<Option<User>> {
    sqlx::query_as("SELECT * FROM users WHERE id=?")
        .bind(user_id)
        .fetch_optional(pool)
        .await
}

pub async fn get_user_by_email(pool: &SqlitePool, email: &str) -> sqlx::Result<Option<User>> {
    sqlx::query_as("SELECT * FROM users WHERE email=?")
        .bind(email)
        .fetch_optional(pool)
        .await
}

pub async fn list_users(pool: &SqlitePool) -> sqlx::Result<Vec<User>> {
    sqlx::query_as("SELECT * FROM users ORDER BY created_at")
        .fetch_all(pool)
        .await
}

pub async fn create_conversation(
    pool: &SqlitePool,
    user1_id: &str,
    user2_id: &str,
) -> sqlx::Result<Conversation> {
    let conversation = Conversation {
        id: new_id(),
        user1_id: user1_id.to_owned(),
        user2_id: user2_id.to_owned(),
        last_message: None,
        last_message_time: None,
    };
    sqlx::query("INSERT INTO conversations (id,user1_id,user2_id) VALUES (?,?,?)")
        .bind(&conversation.id)
        .bind(&conversation.user1_id)
        .bind(&conversation.user2_id)
        .execute(pool)
        .await?;
    Ok(conversation)
}

pub async fn get_conversation(
    pool: &SqlitePool,
    conversation_id: &str,
) -> sqlx::Result<Option<Conversation>> {
    sqlx::query_as("SELECT * FROM conversations WHERE id=?")
        .bind(conversation_id)
        .fetch_optional(pool)
        .await
}

pub async fn conversations_by_user(
    pool: &SqlitePool,
    user_id: &str,
) -> sqlx::Result<Vec<Conversation>> {
    sqlx::query_as("SELECT * FROM conversations WHERE user1_id=? OR user2_id=?")
        .bind(user_id)
        .bind(user_id)
        .fetch_all(pool)
        .await
}

/// Persist a one-to-one message and refresh the conversation's
/// denormalized last-message cache with the same content/timestamp.
pub async fn create_message(
    pool: &SqlitePool,
    conversation_id: &str,
    sender_id: &str,
    content: &str,
    created_at: &str,
) -> sqlx::Result<OneToOneMessage> {
    let message = OneToOneMessage {
        id: new_id(),
        conversation_id: conversation_id.to_owned(),
        sender_id: sender_id.to_owned(),
        content: content.to_owned(),
        created_at: created_at.to_owned(),
    };
    sqlx::query("INSERT INTO one_to_one_messages (id,conversation_id,sender_id,content,created_at) VALUES (?,?,?,?,?)")
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(&message.sender_id)
        .bind(&message.content)
        .bind(&message.created_at)
        .execute(pool)
        .await?;
    sqlx::query("UPDATE conversations SET last_message=?, last_message_time=? WHERE id=?")
        .bind(&message.content)
        .bind(&message.created_at)
        .bind(conversation_id)
        .execute(pool)
        .await?;
    Ok(message)
}

pub async fn messages_by_conversation(
    pool: &SqlitePool,
    conversation_id: &str,
) -> sqlx::Result<Vec<OneToOneMessage>> {
    sqlx::query_as("SELECT * FROM one_to_one_messages WHERE conversation_id=? ORDER BY created_at")
        .bind(conversation_id)
        .fetch_all(pool)
        .await
}

pub async fn create_community(
    pool: &SqlitePool,
    name: &str,
    description: Option<&str>,
) -> sqlx::Result<Community> {
    let community = Community {
        id: new_id(),
        name: name.to_owned(),
        description: description.map(str::to_owned),
        created_at: now_iso(),
    };
    sqlx::query("INSERT INTO communities (id,name,description,created_at) VALUES (?,?,?,?)")
        .bind(&community.id)
        .bind(&community.name)
        .bind(&community.description)
        .bind(&community.created_at)
        .execute(pool)
        .await?;
    Ok(community)
}

pub async fn get_community(
    pool: &SqlitePool,
    community_id: &str,
) -> sqlx::Result<Option<Community>> {
    sqlx::query_as("SELECT * FROM communities WHERE id=?")
        .bind(community_id)
        .fetch_optional(pool)
        .await
}

pub async fn list_communities(pool: &SqlitePool) -> sqlx::Result<Vec<Community>> {
    sqlx::query_as("SELECT * FROM communities ORDER BY created_at")
        .fetch_all(pool)
        .await
}

pub async fn join_community(
    pool: &SqlitePool,
    community_id: &str,
    user_id: &str,
) -> sqlx::Result<Membership> {
    let membership = Membership {
        id: new_id(),
        community_id: community_id.to_owned(),
        user_id: user_id.to_owned(),
        is_admin: false,
        created_at: now_iso(),
    };
    sqlx::query("INSERT INTO memberships (id,community_id,user_id,is_admin,created_at) VALUES (?,?,?,?,?)")
        .bind(&membership.id)
        .bind(&membership.community_id)
        .bind(&membership.user_id)
        .bind(membership.is_admin)
        .bind(&membership.created_at)
        .execute(pool)
        .await?;
    Ok(membership)
}

pub async fn is_member(
    pool: &SqlitePool,
    user_id: &str,
    community_id: &str,
) -> sqlx::Result<bool> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT 1 FROM memberships WHERE user_id=? AND community_id=?")
            .bind(user_id)
            .bind(community_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.is_some())
}

pub async fn create_community_message(
    pool: &SqlitePool,
    community_id: &str,
    sender_id: &str,
    content: &str,
    created_at: &str,
) -> sqlx::Result<CommunityMessage> {
    let message = CommunityMessage {
        id: new_id(),
        community_id: community_id.to_owned(),
        sender_id: sender_id.to_owned(),
        content: content.to_owned(),
        created_at: created_at.to_owned(),
    };
    sqlx::query("INSERT INTO community_messages (id,community_id,sender_id,content,created_at) VALUES (?,?,?,?,?)")
        .bind(&message.id)
        .bind(&message.community_id)
        .bind(&message.sender_id)
        .bind(&message.content)
        .bind(&message.created_at)
        .execute(pool)
        .await?;
    Ok(message)
}

pub async fn get_community_message(
    pool: &SqlitePool,
    message_id: &str,
) -> sqlx::Result<Option<CommunityMessage>> {
    sqlx::query_as("SELECT * FROM community_messages WHERE id=?")
        .bind(message_id)
        .fetch_optional(pool)
        .await
}

pub async fn community_discussion(
    pool: &SqlitePool,
    community_id: &str,
) -> sqlx::Result<Vec<CommunityMessage>> {
    sqlx::query_as("SELECT * FROM community_messages WHERE community_id=? ORDER BY created_at")
        .bind(community_id)
        .fetch_all(pool)
        .await
}

pub async fn create_reply(
    pool: &SqlitePool,
    message_id: &str,
    sender_id: &str,
    content: &str,
    created_at: &str,
) -> sqlx::Result<Reply> {
    let reply = Reply {
        id: new_id(),
        message_id: message_id.to_owned(),
        sender_id: sender_id.to_owned(),
        content: content.to_owned(),
        created_at: created_at.to_owned(),
    };
    sqlx::query("INSERT INTO replies (id,message_id,sender_id,content,created_at) VALUES (?,?,?,?,?)")
        .bind(&reply.id)
        .bind(&reply.message_id)
        .bind(&reply.sender_id)
        .bind(&reply.content)
        .bind(&reply.created_at)
        .execute(pool)
        .await?;
    Ok(reply)
}

pub async fn replies_by_message(
    pool: &SqlitePool,
    message_id: &str,
) -> sqlx::Result<Vec<Reply>> {
    sqlx::query_as("SELECT * FROM replies WHERE message_id=? ORDER BY created_at")
        .bind(message_id)
        .fetch_all(pool)
        .await
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    init_db(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_message_updates_conversation_cache_exactly() {
        let pool = test_pool().await;
        let conversation = create_conversation(&pool, "u1", "u2").await.unwrap();
        assert!(conversation.last_message.is_none());

        let created_at = now_iso();
        let message = create_message(&pool, &conversation.id, "u1", "hi", &created_at)
            .await
            .unwrap();

        let cached = get_conversation(&pool, &conversation.id).await.unwrap().unwrap();
        assert_eq!(cached.last_message.as_deref(), Some("hi"));
        assert_eq!(cached.last_message_time.as_deref(), Some(created_at.as_str()));
        assert_eq!(message.content, "hi");

        let messages = messages_by_conversation(&pool, &conversation.id).await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn membership_checks_and_uniqueness() {
        let pool = test_pool().await;
        let user = create_user(&pool, "a@b.c", "Ana", None).await.unwrap();
        let community = create_community(&pool, "rustaceans", None).await.unwrap();

        assert!(!is_member(&pool, &user.id, &community.id).await.unwrap());
        join_community(&pool, &community.id, &user.id).await.unwrap();
        assert!(is_member(&pool, &user.id, &community.id).await.unwrap());

        // second join violates the (community_id, user_id) unique constraint
        assert!(join_community(&pool, &community.id, &user.id).await.is_err());
    }

    #[tokio::test]
    async fn replies_hang_off_an_existing_community_message() {
        let pool = test_pool().await;
        let community = create_community(&pool, "ferris fans", None).await.unwrap();
        let created_at = now_iso();
        let message =
            create_community_message(&pool, &community.id, "u1", "hello", &created_at)
                .await
                .unwrap();

        assert!(get_community_message(&pool, &message.id).await.unwrap().is_some());
        assert!(get_community_message(&pool, "nope").await.unwrap().is_none());

        let reply = create_reply(&pool, &message.id, "u2", "welcome", &created_at)
            .await
            .unwrap();
        let replies = replies_by_message(&pool, &message.id).await.unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, reply.id);
    }

    #[tokio::test]
    async fn room_ids_are_opaque_lookup_keys() {
        let pool = test_pool().await;
        // ids that are not UUIDs still take the lookup path and simply
        // miss, which is what lets a socket connect be refused with a
        // close frame instead of a routing error
        assert!(get_conversation(&pool, "definitely-not-a-room").await.unwrap().is_none());
        assert!(get_community(&pool, "definitely-not-a-room").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let pool = test_pool().await;
        create_user(&pool, "a@b.c", "Ana", None).await.unwrap();
        assert!(create_user(&pool, "a@b.c", "Ann", None).await.is_err());
        assert!(get_user_by_email(&pool, "a@b.c").await.unwrap().is_some());
    }
}
