use ethers_contract::abigen;

// Struct-typed returns decode as tuples in field order.
abigen!(
    DirectMessenger,
    r#"[
        struct Message { address sender; uint256 timestamp; string content; }
        struct Friend { address pubkey; string name; }
        struct AppUser { string name; address account; }
        function createUser(string name)
        function getUsername(address account) view returns (string)
        function sendMessage(address friend, string content)
        function readMessages(address friend) view returns (Message[])
        function addFriend(address friend, string name)
        function getFriends() view returns (Friend[])
        function blockUser(address account)
        function unblockUser(address account)
        function getAllAppUsers() view returns (AppUser[])
        function getAllBlockedUsers() view returns (address[])
    ]"#
);
