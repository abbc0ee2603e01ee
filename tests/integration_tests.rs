//! Integration tests against the live Gemini API.
//! These tests require an API key in the environment to run.

#[cfg(test)]
mod tests {
    use gemchat::chat::{ChatConfig, ConversationController, ERROR_REPLY, GeminiProvider, Role};
    use gemchat::{ClientConfig, Content, Gemini, GenerateContentRequest, KnownModel, Model};

    fn client() -> Option<Gemini> {
        match ClientConfig::from_env() {
            Ok(config) => Some(Gemini::new(config).expect("Failed to create client")),
            Err(_) => {
                eprintln!("Skipping test: API_KEY not set");
                None
            }
        }
    }

    #[tokio::test]
    async fn test_simple_generate_request() {
        let Some(client) = client() else {
            return;
        };

        let request = GenerateContentRequest::new(vec![Content::new_with_text(
            "Say 'test passed'",
            Role::User,
        )]);
        let response = client
            .generate_content(&Model::Known(KnownModel::Gemini25Flash), &request)
            .await;
        assert!(
            response.is_ok(),
            "Request should succeed with valid API key"
        );
    }

    #[tokio::test]
    async fn test_streamed_conversation() {
        let Some(client) = client() else {
            return;
        };

        let provider = GeminiProvider::new(client);
        let controller = ConversationController::bootstrap(&provider, &ChatConfig::default())
            .expect("Failed to bootstrap conversation");
        controller
            .send("Count to 3")
            .expect("send should be accepted")
            .finished()
            .await;
        controller
            .send("Now count back down")
            .expect("send should be accepted")
            .finished()
            .await;

        let state = controller.snapshot();
        assert_eq!(state.len(), 5);
        for reply in [&state.messages()[2], &state.messages()[4]] {
            assert_eq!(reply.role, Role::Model);
            assert!(!reply.text.is_empty());
            assert_ne!(reply.text, ERROR_REPLY);
        }
    }

    #[tokio::test]
    async fn test_bad_key_is_replaced_by_apology() {
        if client().is_none() {
            return;
        }

        let config = ClientConfig::new("not-a-real-key").expect("Failed to create config");
        let provider = GeminiProvider::new(Gemini::new(config).expect("Failed to create client"));
        let controller = ConversationController::bootstrap(&provider, &ChatConfig::default())
            .expect("Failed to bootstrap conversation");
        controller
            .send("hello")
            .expect("send should be accepted")
            .finished()
            .await;
        assert_eq!(controller.snapshot().last().unwrap().text, ERROR_REPLY);
    }
}
